//! Node identity and host information.
//!
//! Cellular nodes are identified by the 6-byte MAC of their ethernet
//! interface, Meshtastic radios by their 32-bit node id. Both render as
//! lowercase hex (12 or 8 digits) and that rendering is what MQTT topics
//! are derived from.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::prelude::*;

use crate::error::Error;
use crate::proto::{CellNetworkType, MiniCallHome};

/// CPU frequency fields of a MiniCallHome are in units of 20 MHz.
pub const FREQ_MULTIPLIER: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAddress {
    /// A full 6-byte MAC address of a cellular/broadband node.
    Full([u8; 6]),
    /// A Meshtastic node id.
    Meshtastic(u32),
}

impl Default for MacAddress {
    fn default() -> Self {
        Self::Full([0; 6])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(mac) => write!(f, "{}", hex::encode(mac)),
            Self::Meshtastic(id) => write!(f, "{id:08x}"),
        }
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    /// Parses 12 hex digits as a full MAC, 8 hex digits as a Meshtastic id.
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.len() {
            12 => {
                let bytes =
                    hex::decode(s).map_err(|_| Error::InvalidMacAddress(s.to_owned()))?;
                Ok(Self::Full(bytes.try_into().unwrap()))
            }
            8 => {
                let id = u32::from_str_radix(s, 16)
                    .map_err(|_| Error::InvalidMacAddress(s.to_owned()))?;
                Ok(Self::Meshtastic(id))
            }
            _ => Err(Error::InvalidMacAddress(s.to_owned())),
        }
    }
}

/// Name and MAC of a node, carried as punch provenance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostInfo {
    pub name: String,
    pub mac_address: MacAddress,
}

impl HostInfo {
    pub fn new(name: &str, mac_address: MacAddress) -> Self {
        Self {
            name: name.to_owned(),
            mac_address,
        }
    }
}

/// Cellular signal readings attached to status updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSignalInfo {
    pub network_type: CellNetworkType,
    pub dbm: i32,
    pub cellid: u64,
}

/// MAC address of the first ethernet interface, without colons.
pub fn eth_mac_addr() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('e') {
            if let Ok(addr) = std::fs::read_to_string(entry.path().join("address")) {
                return Some(addr.trim().replace(':', ""));
            }
        }
    }
    None
}

pub fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// The local IPv4 address packed big-endian into a u32, the way the
/// MiniCallHome proto carries it. Routing a datagram socket at a public
/// address selects the outbound interface without sending anything.
pub fn local_ipv4() -> Option<u32> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(u32::from(*addr.ip())),
        _ => None,
    }
}

pub fn format_ipv4(packed: u32) -> String {
    Ipv4Addr::from(packed).to_string()
}

/// Assembles a MiniCallHome with what the host can tell without any
/// platform-specific probes. Signal readings are filled in by the sink
/// that owns the modem.
pub fn create_mini_call_home(now: DateTime<Utc>) -> MiniCallHome {
    MiniCallHome {
        time: Some(crate::proto::timestamp(now)),
        local_ip: local_ipv4().unwrap_or(0),
        ..Default::default()
    }
}

#[cfg(test)]
mod test_mac_address {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mac: MacAddress = "abcdef012345".parse().unwrap();
        assert_eq!(mac, MacAddress::Full([0xab, 0xcd, 0xef, 0x01, 0x23, 0x45]));
        assert_eq!(mac.to_string(), "abcdef012345");

        let msh: MacAddress = "deadbeef".parse().unwrap();
        assert_eq!(msh, MacAddress::Meshtastic(0xdeadbeef));
        assert_eq!(msh.to_string(), "deadbeef");
    }

    #[test]
    fn test_invalid() {
        assert!("abcd".parse::<MacAddress>().is_err());
        assert!("zzcdef012345".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_format_ipv4() {
        assert_eq!(format_ipv4(0xc0a8010e), "192.168.1.14");
    }
}
