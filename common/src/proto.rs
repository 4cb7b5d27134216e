//! Protobuf wire messages for the `yar/<mac>/p` and `yar/<mac>/status`
//! topics.
//!
//! The messages are small and stable, so they are written out by hand
//! instead of being generated from a schema at build time; tags must not
//! change, field nodes in the wild encode with them.

use chrono::prelude::*;

/// A single raw SI punch record.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Punch {
    #[prost(bytes = "vec", tag = "1")]
    pub raw: Vec<u8>,
}

/// A batch of punches, the payload of `yar/<mac>/p`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Punches {
    #[prost(message, repeated, tag = "1")]
    pub punches: Vec<Punch>,
    #[prost(message, optional, tag = "2")]
    pub sending_timestamp: Option<prost_types::Timestamp>,
}

/// Last-will payload: the broker publishes this when a client dies.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Disconnected {
    #[prost(string, tag = "1")]
    pub client_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    Added = 0,
    Removed = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum CellNetworkType {
    UnknownNetwork = 0,
    Umts = 1,
    Lte = 2,
    NbIotEcl0 = 3,
}

/// A device was attached to or detached from a field node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DevEvent {
    #[prost(enumeration = "EventType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub port: String,
}

/// Periodic node telemetry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MiniCallHome {
    #[prost(message, optional, tag = "1")]
    pub time: Option<prost_types::Timestamp>,
    #[prost(float, tag = "2")]
    pub cpu_temperature: f32,
    #[prost(sint32, tag = "3")]
    pub signal_dbm: i32,
    #[prost(uint64, tag = "4")]
    pub cellid: u64,
    #[prost(enumeration = "CellNetworkType", tag = "5")]
    pub network_type: i32,
    #[prost(uint32, tag = "6")]
    pub millivolts: u32,
    /// CPU frequencies in units of 20 MHz.
    #[prost(uint32, tag = "7")]
    pub freq: u32,
    #[prost(uint32, tag = "8")]
    pub min_freq: u32,
    #[prost(uint32, tag = "9")]
    pub max_freq: u32,
    #[prost(fixed32, tag = "10")]
    pub local_ip: u32,
    #[prost(uint64, tag = "11")]
    pub totaldatatx: u64,
    #[prost(uint64, tag = "12")]
    pub totaldatarx: u64,
    /// Control codes seen by the node's readers, comma-separated, or a
    /// `siadded-`/`siremoved-` device-event marker.
    #[prost(string, tag = "13")]
    pub codes: String,
}

/// The payload of `yar/<mac>/status`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    #[prost(oneof = "status::Msg", tags = "1, 2, 3")]
    pub msg: Option<status::Msg>,
}

pub mod status {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Disconnected(super::Disconnected),
        #[prost(message, tag = "2")]
        MiniCallHome(super::MiniCallHome),
        #[prost(message, tag = "3")]
        DevEvent(super::DevEvent),
    }
}

pub fn timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

pub fn from_timestamp(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos as u32).single()
}

#[cfg(test)]
mod test_proto {
    use super::*;
    use prost::Message;

    #[test]
    fn test_punches_roundtrip() {
        let punches = Punches {
            punches: vec![Punch {
                raw: vec![0xff, 0x02, 0xd3],
            }],
            sending_timestamp: Some(timestamp(Utc::now())),
        };
        let bytes = punches.encode_to_vec();
        let decoded = Punches::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, punches);
    }

    #[test]
    fn test_status_oneof() {
        let status = Status {
            msg: Some(status::Msg::DevEvent(DevEvent {
                r#type: EventType::Added as i32,
                port: "ttyUSB0".to_owned(),
            })),
        };
        let decoded = Status::decode(status.encode_to_vec().as_slice()).unwrap();
        match decoded.msg {
            Some(status::Msg::DevEvent(dev_event)) => {
                assert_eq!(dev_event.r#type(), EventType::Added);
                assert_eq!(dev_event.port, "ttyUSB0");
            }
            _ => panic!("wrong oneof variant"),
        }
    }

    #[test]
    fn test_timestamp_conversion() {
        let now = Utc::now();
        let converted = from_timestamp(&timestamp(now)).unwrap();
        assert_eq!(converted, now);
    }
}
