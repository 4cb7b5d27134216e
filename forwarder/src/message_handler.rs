//! Topic router of the forwarder.
//!
//! Every inbound MQTT publish lands here: `…/p` and `…/status` topics of
//! the cellular nodes, plus the Meshtastic gateway passthrough. Decoding
//! failures are logged and dropped, the loop never dies on a message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::prelude::*;
use prost::Message;
use tracing::{error, info};

use punchgate_common::clients::ClientGroup;
use punchgate_common::proto::{from_timestamp, status, Punches, Status};
use punchgate_common::punch::{SiPunch, SiPunchLog};
use punchgate_common::system_info::{CellSignalInfo, MacAddress};

use crate::meshtastic::{self, MshStatusEvent};
use crate::state::StatusTracker;

pub struct MessageHandler {
    tracker: Arc<StdMutex<StatusTracker>>,
    client_group: Arc<ClientGroup>,
    meshtastic_channel: String,
    /// Gateway MAC that serial-passthrough punches are attributed to, so
    /// downstream sinks see a configured node.
    meshtastic_gateway: Option<MacAddress>,
    /// Receiving gateway of the meshtastic topics, for distance logs.
    meshtastic_recv: Option<MacAddress>,
}

impl MessageHandler {
    pub fn new(
        dns: HashMap<MacAddress, String>,
        client_group: Arc<ClientGroup>,
        meshtastic_channel: String,
        meshtastic_gateway: Option<MacAddress>,
    ) -> Self {
        Self {
            tracker: Arc::new(StdMutex::new(StatusTracker::new(dns))),
            client_group,
            meshtastic_channel,
            meshtastic_gateway,
            meshtastic_recv: None,
        }
    }

    /// The tracker handle for the display task.
    pub fn tracker(&self) -> Arc<StdMutex<StatusTracker>> {
        self.tracker.clone()
    }

    pub async fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let now = Local::now().fixed_offset();
        if topic.ends_with("/p") {
            match extract_mac(topic) {
                Some(mac_address) => self.handle_punches(mac_address, payload, now).await,
                None => error!("Invalid topic: {topic}"),
            }
        } else if topic.ends_with("/status") {
            match extract_mac(topic) {
                Some(mac_address) => self.handle_status(mac_address, payload, now).await,
                None => error!("Invalid topic: {topic}"),
            }
        } else if topic.starts_with("yar/2/c/serial/") {
            self.handle_meshtastic_serial(payload, now).await;
        } else if topic.starts_with(&format!("yar/2/c/{}/", self.meshtastic_channel)) {
            self.meshtastic_recv = extract_msh_recv_mac(topic);
            self.handle_meshtastic_status(payload, now);
        }
    }

    async fn handle_punches(
        &mut self,
        mac_address: MacAddress,
        payload: &[u8],
        now: DateTime<FixedOffset>,
    ) {
        let punches = match Punches::decode(payload) {
            Ok(punches) => punches,
            Err(err) => {
                error!("Error while parsing Punches: {err}");
                return;
            }
        };
        let send_time = punches.sending_timestamp.as_ref().and_then(from_timestamp);

        let mut punch_logs = Vec::with_capacity(punches.punches.len());
        {
            let mut tracker = self.tracker.lock().unwrap();
            let host_info = tracker.resolve(mac_address);
            let status = tracker.cellular_status(mac_address);
            for punch in punches.punches {
                let raw: Result<[u8; 20], _> = punch.raw.as_slice().try_into();
                let Ok(raw) = raw else {
                    error!("Wrong length of punch chunk={}", punch.raw.len());
                    continue;
                };
                let si_punch = SiPunch::from_raw(raw, mac_address, &now);
                status.punch(&si_punch);
                punch_logs.push(SiPunchLog::new(si_punch, host_info.clone(), &now));
            }
        }

        for punch_log in punch_logs {
            self.process_punch(punch_log, send_time, now).await;
        }
    }

    async fn process_punch(
        &self,
        punch_log: SiPunchLog,
        send_time: Option<DateTime<Utc>>,
        now: DateTime<FixedOffset>,
    ) {
        match send_time {
            Some(send_time) => info!(
                "{} {}, sent {}, network latency {:5.2}s",
                punch_log.host_info.name,
                punch_log.punch,
                send_time.with_timezone(now.offset()).format("%H:%M:%S%.3f"),
                (now.with_timezone(&Utc) - send_time).num_milliseconds() as f64 / 1000.0,
            ),
            None => info!("{punch_log}"),
        }
        let results = self.client_group.send_punch(&punch_log).await;
        if !results.is_empty() && results.iter().all(|sent| !sent) {
            error!("Punch of card {} reached no sink", punch_log.punch.card);
        }
    }

    async fn handle_status(
        &mut self,
        mac_address: MacAddress,
        payload: &[u8],
        now: DateTime<FixedOffset>,
    ) {
        let status = match Status::decode(payload) {
            Ok(status) => status,
            Err(err) => {
                error!("Error while parsing Status: {err}");
                return;
            }
        };

        match &status.msg {
            Some(status::Msg::Disconnected(disconnected)) => {
                info!("Disconnected {}", disconnected.client_name);
                self.tracker.lock().unwrap().cellular_status(mac_address).disconnect();
                // Disconnects are not forwarded, they concern this operator
            }
            Some(status::Msg::MiniCallHome(mini_call_home)) => {
                {
                    let mut tracker = self.tracker.lock().unwrap();
                    let name = tracker.resolve(mac_address).name;
                    let cellular = tracker.cellular_status(mac_address);
                    if mini_call_home.millivolts > 0 {
                        cellular
                            .update_voltage(f64::from(mini_call_home.millivolts) / 1000.0);
                    }
                    if mini_call_home.cellid > 0 || mini_call_home.signal_dbm != 0 {
                        cellular.mqtt_connect_update(CellSignalInfo {
                            network_type: mini_call_home.network_type(),
                            dbm: mini_call_home.signal_dbm,
                            cellid: mini_call_home.cellid,
                        });
                    }
                    let orig_time = mini_call_home
                        .time
                        .as_ref()
                        .and_then(from_timestamp)
                        .map(|time| time.with_timezone(now.offset()).format("%H:%M:%S").to_string())
                        .unwrap_or_default();
                    info!(
                        "{name} {orig_time}: {}dBm, cell {:x}, {:.2}V, latency {:5.2}s",
                        mini_call_home.signal_dbm,
                        mini_call_home.cellid,
                        f64::from(mini_call_home.millivolts) / 1000.0,
                        latency_s(&mini_call_home.time, now),
                    );
                }
                self.client_group.send_status(&status, &mac_address).await;
            }
            Some(status::Msg::DevEvent(dev_event)) => {
                let name = self.tracker.lock().unwrap().resolve(mac_address).name;
                info!("{name} device event: {:?} {}", dev_event.r#type(), dev_event.port);
                self.client_group.send_status(&status, &mac_address).await;
            }
            None => error!("Empty status message"),
        }
    }

    fn handle_meshtastic_status(&mut self, payload: &[u8], now: DateTime<FixedOffset>) {
        let Some(event) = meshtastic::parse_status_envelope(payload) else {
            return;
        };
        let mut tracker = self.tracker.lock().unwrap();
        match event {
            MshStatusEvent::Telemetry {
                mac_address,
                time,
                voltage,
                battery,
                rssi_snr,
            } => {
                let name = tracker.resolve(mac_address).name;
                let rssi_snr = self.annotated_rssi(&tracker, mac_address, rssi_snr);
                let status = tracker.meshtastic_status(mac_address);
                if let Some(battery) = battery {
                    status.update_battery(battery);
                }
                match &rssi_snr {
                    Some(rssi_snr) => status.update_rssi_snr(rssi_snr.clone()),
                    None => status.clear_rssi_snr(),
                }
                info!(
                    "{name} {}: {:.3}V {}% {}",
                    format_time(time, now),
                    voltage.unwrap_or_default(),
                    battery.unwrap_or_default(),
                    rssi_snr.map(|r| r.to_string()).unwrap_or_default(),
                );
            }
            MshStatusEvent::Position {
                mac_address,
                position,
                time,
                rssi_snr,
            } => {
                let name = tracker.resolve(mac_address).name;
                let rssi_snr = self.annotated_rssi(&tracker, mac_address, rssi_snr);
                tracker
                    .meshtastic_status(mac_address)
                    .update_position(position.lat, position.lon);
                if let Some(rssi_snr) = &rssi_snr {
                    tracker.meshtastic_status(mac_address).update_rssi_snr(rssi_snr.clone());
                }
                info!(
                    "{name} {}: {:.5},{:.5} {}",
                    format_time(time, now),
                    position.lat,
                    position.lon,
                    rssi_snr.map(|r| r.to_string()).unwrap_or_default(),
                );
            }
            MshStatusEvent::RangeTest {
                mac_address,
                sequence,
                rx_time,
                rssi_snr,
            } => {
                let name = tracker.resolve(mac_address).name;
                let rssi_snr = self.annotated_rssi(&tracker, mac_address, rssi_snr);
                info!(
                    "{name} {}: range test {sequence}, {}",
                    format_time(rx_time, now),
                    rssi_snr
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "undefined distance".to_owned()),
                );
            }
            MshStatusEvent::Ignored => {}
        }
    }

    /// Annotates link quality with the distance between the sender and the
    /// receiving gateway, when both positions are known.
    fn annotated_rssi(
        &self,
        tracker: &StatusTracker,
        mac_address: MacAddress,
        rssi_snr: Option<meshtastic::RssiSnr>,
    ) -> Option<meshtastic::RssiSnr> {
        let mut rssi_snr = rssi_snr?;
        if let Some(recv_mac) = self.meshtastic_recv {
            if let Some(meters) = tracker.distance_m(recv_mac, mac_address) {
                let name = tracker.resolve(recv_mac).name;
                rssi_snr.add_distance(meters, name);
            }
        }
        Some(rssi_snr)
    }

    async fn handle_meshtastic_serial(&mut self, payload: &[u8], now: DateTime<FixedOffset>) {
        let Some((mac_address, serial_payload)) = meshtastic::parse_serial_envelope(payload)
        else {
            return;
        };

        let mut punch_logs = Vec::new();
        {
            let mut tracker = self.tracker.lock().unwrap();
            // Attribute the punch to the configured gateway so downstream
            // sinks see a known node
            let forward_mac = self.meshtastic_gateway.unwrap_or(mac_address);
            let host_info = tracker.resolve(forward_mac);
            let punches = SiPunch::punches_from_payload(&serial_payload, forward_mac, &now);
            let status = tracker.meshtastic_status(mac_address);
            for punch in punches {
                match punch {
                    Ok(punch) => {
                        status.punch(&punch);
                        punch_logs.push(SiPunchLog::new(punch, host_info.clone(), &now));
                    }
                    Err(err) => error!("Failed to decode punch: {err}"),
                }
            }
        }

        for punch_log in punch_logs {
            self.process_punch(punch_log, None, now).await;
        }
    }
}

fn latency_s(timestamp: &Option<prost_types::Timestamp>, now: DateTime<FixedOffset>) -> f64 {
    timestamp
        .as_ref()
        .and_then(from_timestamp)
        .map(|time| (now.with_timezone(&Utc) - time).num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default()
}

fn format_time(time: Option<DateTime<FixedOffset>>, now: DateTime<FixedOffset>) -> String {
    time.unwrap_or(now).format("%H:%M:%S").to_string()
}

/// `yar/<mac12>/…` → the node's MAC address.
fn extract_mac(topic: &str) -> Option<MacAddress> {
    let mac = topic.strip_prefix("yar/")?.split('/').next()?;
    if mac.len() != 12 {
        return None;
    }
    mac.parse().ok()
}

/// `yar/2/c/<channel>/!<mac8>` → the receiving gateway's MAC.
fn extract_msh_recv_mac(topic: &str) -> Option<MacAddress> {
    let last = topic.rsplit('/').next()?;
    last.strip_prefix('!')?.parse().ok()
}
