//! Per-node status tracking for the operator display.
//!
//! The ingest task mutates the trackers as messages come in; the table
//! task takes short-lived snapshots once a minute.

use std::collections::{HashMap, HashSet};

use chrono::prelude::*;

use punchgate_common::punch::SiPunch;
use punchgate_common::system_info::{CellSignalInfo, HostInfo, MacAddress};

use crate::meshtastic::RssiSnr;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalInfo {
    Unknown,
    Cell(CellSignalInfo),
    Meshtastic(RssiSnr),
}

pub struct NodeInfo {
    pub name: String,
    pub signal_info: SignalInfo,
    pub codes: Vec<u16>,
    pub last_update: Option<DateTime<FixedOffset>>,
    pub last_punch: Option<DateTime<FixedOffset>>,
}

#[derive(Default, Clone)]
pub struct CellularStatus {
    host_info: HostInfo,
    signal: Option<CellSignalInfo>,
    voltage: Option<f64>,
    codes: HashSet<u16>,
    last_update: Option<DateTime<FixedOffset>>,
    last_punch: Option<DateTime<FixedOffset>>,
}

impl CellularStatus {
    pub fn new(host_info: HostInfo) -> Self {
        Self {
            host_info,
            ..Self::default()
        }
    }

    pub fn disconnect(&mut self) {
        self.signal = None;
        self.last_update = Some(Local::now().fixed_offset());
    }

    pub fn update_voltage(&mut self, voltage: f64) {
        self.voltage = Some(voltage);
    }

    pub fn mqtt_connect_update(&mut self, signal: CellSignalInfo) {
        self.signal = Some(signal);
        self.last_update = Some(Local::now().fixed_offset());
    }

    pub fn punch(&mut self, punch: &SiPunch) {
        self.last_punch = Some(punch.time);
        self.codes.insert(punch.code);
    }

    pub fn serialize(&self) -> NodeInfo {
        let signal_info = match self.signal {
            Some(signal) => SignalInfo::Cell(signal),
            None => SignalInfo::Unknown,
        };
        let mut codes: Vec<u16> = self.codes.iter().copied().collect();
        codes.sort_unstable();
        NodeInfo {
            name: self.host_info.name.clone(),
            signal_info,
            codes,
            last_update: self.last_update,
            last_punch: self.last_punch,
        }
    }
}

#[derive(Default, Clone)]
pub struct MeshtasticStatus {
    pub name: String,
    battery: Option<u32>,
    pub rssi_snr: Option<RssiSnr>,
    pub position: Option<Position>,
    codes: HashSet<u16>,
    last_update: Option<DateTime<FixedOffset>>,
    last_punch: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl MeshtasticStatus {
    pub fn new(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn update_battery(&mut self, percent: u32) {
        self.battery = Some(percent);
        self.last_update = Some(Local::now().fixed_offset());
    }

    pub fn update_position(&mut self, lat: f64, lon: f64) {
        self.position = Some(Position { lat, lon });
        self.last_update = Some(Local::now().fixed_offset());
    }

    pub fn update_rssi_snr(&mut self, rssi_snr: RssiSnr) {
        self.rssi_snr = Some(rssi_snr);
        self.last_update = Some(Local::now().fixed_offset());
    }

    pub fn clear_rssi_snr(&mut self) {
        self.rssi_snr = None;
        self.last_update = Some(Local::now().fixed_offset());
    }

    pub fn punch(&mut self, punch: &SiPunch) {
        self.last_punch = Some(punch.time);
        self.codes.insert(punch.code);
    }

    pub fn serialize(&self) -> NodeInfo {
        let signal_info = match &self.rssi_snr {
            Some(rssi_snr) => SignalInfo::Meshtastic(rssi_snr.clone()),
            None => SignalInfo::Unknown,
        };
        let mut codes: Vec<u16> = self.codes.iter().copied().collect();
        codes.sort_unstable();
        NodeInfo {
            name: self.name.clone(),
            signal_info,
            codes,
            last_update: self.last_update,
            last_punch: self.last_punch,
        }
    }
}

/// All node statuses, keyed by MAC, plus the name resolution table.
pub struct StatusTracker {
    dns: HashMap<MacAddress, String>,
    cellular: HashMap<MacAddress, CellularStatus>,
    meshtastic: HashMap<MacAddress, MeshtasticStatus>,
}

impl StatusTracker {
    pub fn new(dns: HashMap<MacAddress, String>) -> Self {
        Self {
            dns,
            cellular: HashMap::new(),
            meshtastic: HashMap::new(),
        }
    }

    pub fn resolve(&self, mac_address: MacAddress) -> HostInfo {
        let name = self
            .dns
            .get(&mac_address)
            .cloned()
            .unwrap_or_else(|| format!("MAC {mac_address}"));
        HostInfo {
            name,
            mac_address,
        }
    }

    pub fn cellular_status(&mut self, mac_address: MacAddress) -> &mut CellularStatus {
        let host_info = self.resolve(mac_address);
        self.cellular.entry(mac_address).or_insert_with(|| CellularStatus::new(host_info))
    }

    pub fn meshtastic_status(&mut self, mac_address: MacAddress) -> &mut MeshtasticStatus {
        let host_info = self.resolve(mac_address);
        self.meshtastic
            .entry(mac_address)
            .or_insert_with(|| MeshtasticStatus::new(host_info.name))
    }

    /// Distance in meters between the last known positions of two radio
    /// nodes, when both are known.
    pub fn distance_m(&self, mac_a: MacAddress, mac_b: MacAddress) -> Option<f64> {
        let a = self.meshtastic.get(&mac_a)?.position?;
        let b = self.meshtastic.get(&mac_b)?.position?;
        crate::meshtastic::distance_m(a, b)
    }

    pub fn node_infos(&self) -> Vec<NodeInfo> {
        let mut infos: Vec<NodeInfo> = self
            .meshtastic
            .values()
            .map(MeshtasticStatus::serialize)
            .chain(self.cellular.values().map(CellularStatus::serialize))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Rows of the operator status table: name, signal, codes, last
    /// update age, last punch age.
    pub fn info_table(&self, now: DateTime<FixedOffset>) -> Vec<[String; 5]> {
        self.node_infos()
            .into_iter()
            .map(|info| {
                let signal = match info.signal_info {
                    SignalInfo::Unknown => String::new(),
                    SignalInfo::Cell(cell) => format!("{}dBm", cell.dbm),
                    SignalInfo::Meshtastic(rssi_snr) => {
                        format!("{}dBm {:.1}SNR", rssi_snr.rssi_dbm, rssi_snr.snr)
                    }
                };
                let codes: Vec<String> = info.codes.iter().map(u16::to_string).collect();
                [
                    info.name,
                    signal,
                    codes.join(","),
                    human_time(info.last_update, now),
                    human_time(info.last_punch, now),
                ]
            })
            .collect()
    }
}

fn human_time(timestamp: Option<DateTime<FixedOffset>>, now: DateTime<FixedOffset>) -> String {
    let Some(timestamp) = timestamp else {
        return String::new();
    };
    let secs = (now - timestamp).num_milliseconds() as f64 / 1000.0;
    if secs < 10.0 {
        format!("{secs:.1}s ago")
    } else if secs < 60.0 {
        format!("{secs:.0}s ago")
    } else if secs < 600.0 {
        format!("{:.1}m ago", secs / 60.0)
    } else if secs < 3600.0 {
        format!("{:.0}m ago", secs / 60.0)
    } else {
        format!("{:.1}h ago", secs / 3600.0)
    }
}
