//! Meshtastic service-envelope handling.
//!
//! Radio nodes reach the forwarder through the Meshtastic MQTT gateway:
//! `yar/2/c/serial/!<mac>` carries raw SI records from the serial module,
//! `yar/2/c/<channel>/!<mac>` telemetry, positions and range tests. Only
//! the portnums consumed here are understood, everything else is ignored.

use chrono::prelude::*;
use meshtastic::protobufs::telemetry::Variant;
use meshtastic::protobufs::{mesh_packet::PayloadVariant, Data, PortNum, Position, ServiceEnvelope, Telemetry};
use meshtastic::Message as MeshtasticMessage;
use tracing::error;

use punchgate_common::system_info::MacAddress;

use crate::state;

const SERIAL_APP: i32 = PortNum::SerialApp as i32;
const TELEMETRY_APP: i32 = PortNum::TelemetryApp as i32;
const POSITION_APP: i32 = PortNum::PositionApp as i32;
const RANGE_TEST_APP: i32 = PortNum::RangeTestApp as i32;

/// Positions come scaled by 1e-7 degrees.
const POSITION_SCALE: f64 = 1e-7;
const BROADCAST: u32 = u32::MAX;

/// Radio-link quality of a received packet, optionally annotated with the
/// distance to the receiving gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct RssiSnr {
    pub rssi_dbm: i32,
    pub snr: f32,
    pub distance: Option<(f64, String)>,
}

impl RssiSnr {
    pub fn new(rx_rssi: i32, snr: f32) -> Option<Self> {
        match rx_rssi {
            0 => None,
            rssi_dbm => Some(RssiSnr {
                rssi_dbm,
                snr,
                distance: None,
            }),
        }
    }

    pub fn add_distance(&mut self, meters: f64, name: String) {
        self.distance = Some((meters, name));
    }
}

impl std::fmt::Display for RssiSnr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}dBm {:.2}SNR", self.rssi_dbm, self.snr)?;
        if let Some((meters, name)) = &self.distance {
            write!(f, " {:.2}km from {name}", meters / 1000.0)?;
        }
        Ok(())
    }
}

/// A status-channel event the tracker cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum MshStatusEvent {
    Telemetry {
        mac_address: MacAddress,
        time: Option<DateTime<FixedOffset>>,
        voltage: Option<f32>,
        battery: Option<u32>,
        rssi_snr: Option<RssiSnr>,
    },
    Position {
        mac_address: MacAddress,
        position: state::Position,
        time: Option<DateTime<FixedOffset>>,
        rssi_snr: Option<RssiSnr>,
    },
    RangeTest {
        mac_address: MacAddress,
        sequence: String,
        rx_time: Option<DateTime<FixedOffset>>,
        rssi_snr: Option<RssiSnr>,
    },
    /// Unhandled portnum, encrypted packet or a non-broadcast position.
    Ignored,
}

fn decoded_packet(payload: &[u8]) -> Option<(meshtastic::protobufs::MeshPacket, Data)> {
    let envelope = match ServiceEnvelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            error!("Error while parsing ServiceEnvelope: {err}");
            return None;
        }
    };
    let packet = envelope.packet?;
    match packet.payload_variant.clone() {
        Some(PayloadVariant::Decoded(data)) => Some((packet, data)),
        _ => {
            error!("Encrypted message! Disable encryption for meshtastic MQTT");
            None
        }
    }
}

fn timestamp(epoch: u32) -> Option<DateTime<FixedOffset>> {
    Local.timestamp_opt(i64::from(epoch), 0).single().map(|time| time.fixed_offset())
}

/// Parses one envelope of the Meshtastic status channel.
pub fn parse_status_envelope(payload: &[u8]) -> Option<MshStatusEvent> {
    let (packet, data) = decoded_packet(payload)?;
    let mac_address = MacAddress::Meshtastic(packet.from);
    let rssi_snr = RssiSnr::new(packet.rx_rssi, packet.rx_snr);

    match data.portnum {
        TELEMETRY_APP => {
            let telemetry = match Telemetry::decode(data.payload.as_slice()) {
                Ok(telemetry) => telemetry,
                Err(err) => {
                    error!("Error while parsing Telemetry: {err}");
                    return None;
                }
            };
            let Some(Variant::DeviceMetrics(metrics)) = telemetry.variant else {
                return Some(MshStatusEvent::Ignored);
            };
            Some(MshStatusEvent::Telemetry {
                mac_address,
                time: timestamp(telemetry.time),
                voltage: metrics.voltage,
                battery: metrics.battery_level,
                rssi_snr,
            })
        }
        POSITION_APP => {
            // Position requests are addressed to one node; only broadcasts
            // carry the node's own position.
            if packet.to != BROADCAST {
                return Some(MshStatusEvent::Ignored);
            }
            let position = match Position::decode(data.payload.as_slice()) {
                Ok(position) => position,
                Err(err) => {
                    error!("Error while parsing Position: {err}");
                    return None;
                }
            };
            Some(MshStatusEvent::Position {
                mac_address,
                position: state::Position {
                    lat: f64::from(position.latitude_i.unwrap_or_default()) * POSITION_SCALE,
                    lon: f64::from(position.longitude_i.unwrap_or_default()) * POSITION_SCALE,
                },
                time: timestamp(position.time),
                rssi_snr,
            })
        }
        RANGE_TEST_APP => {
            if packet.rx_rssi == 0 {
                return Some(MshStatusEvent::Ignored);
            }
            Some(MshStatusEvent::RangeTest {
                mac_address,
                sequence: String::from_utf8_lossy(&data.payload).into_owned(),
                rx_time: timestamp(packet.rx_time),
                rssi_snr,
            })
        }
        _ => Some(MshStatusEvent::Ignored),
    }
}

/// Extracts the raw SI payload of a serial-module envelope, together with
/// the sending radio's MAC.
pub fn parse_serial_envelope(payload: &[u8]) -> Option<(MacAddress, Vec<u8>)> {
    let (packet, data) = decoded_packet(payload)?;
    if data.portnum != SERIAL_APP {
        return None;
    }
    Some((MacAddress::Meshtastic(packet.from), data.payload))
}

pub fn distance_m(a: state::Position, b: state::Position) -> Option<f64> {
    let from = geoutils::Location::new(a.lat, a.lon);
    let to = geoutils::Location::new(b.lat, b.lon);
    from.distance_to(&to).ok().map(|distance| distance.meters())
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use meshtastic::protobufs::MeshPacket;

    pub fn serial_envelope(from: u32, raw: &[u8]) -> Vec<u8> {
        ServiceEnvelope {
            packet: Some(MeshPacket {
                payload_variant: Some(PayloadVariant::Decoded(Data {
                    portnum: SERIAL_APP,
                    payload: raw.to_vec(),
                    ..Default::default()
                })),
                from,
                to: BROADCAST,
                ..Default::default()
            }),
            ..Default::default()
        }
        .encode_to_vec()
    }
}

#[cfg(test)]
mod test_meshtastic {
    use super::*;
    use meshtastic::protobufs::{DeviceMetrics, MeshPacket};

    fn envelope(from: u32, rx_rssi: i32, rx_snr: f32, to: u32, data: Data) -> Vec<u8> {
        ServiceEnvelope {
            packet: Some(MeshPacket {
                payload_variant: Some(PayloadVariant::Decoded(data)),
                from,
                to,
                rx_rssi,
                rx_snr,
                ..Default::default()
            }),
            ..Default::default()
        }
        .encode_to_vec()
    }

    #[test]
    fn test_parse_serial() {
        let raw =
            b"\xff\x02\xd3\x0d\x00\x2f\x00\x1a\x2b\x3c\x08\x8c\xa3\xcb\x02\x00\x01\x50\xe3\x03";
        let message = envelope(
            0xdeadbeef,
            0,
            0.0,
            BROADCAST,
            Data {
                portnum: SERIAL_APP,
                payload: raw.to_vec(),
                ..Default::default()
            },
        );
        let (mac_address, payload) = parse_serial_envelope(&message).unwrap();
        assert_eq!(mac_address, MacAddress::Meshtastic(0xdeadbeef));
        assert_eq!(payload, raw.to_vec());
    }

    #[test]
    fn test_parse_telemetry() {
        let telemetry = Telemetry {
            time: 1735157442,
            variant: Some(Variant::DeviceMetrics(DeviceMetrics {
                battery_level: Some(47),
                voltage: Some(3.712),
                ..Default::default()
            })),
            ..Default::default()
        };
        let message = envelope(
            0xdeadbeef,
            -98,
            4.0,
            BROADCAST,
            Data {
                portnum: TELEMETRY_APP,
                payload: telemetry.encode_to_vec(),
                ..Default::default()
            },
        );
        match parse_status_envelope(&message).unwrap() {
            MshStatusEvent::Telemetry {
                mac_address,
                voltage,
                battery,
                rssi_snr,
                ..
            } => {
                assert_eq!(mac_address, MacAddress::Meshtastic(0xdeadbeef));
                assert_eq!(voltage, Some(3.712));
                assert_eq!(battery, Some(47));
                let rssi_snr = rssi_snr.unwrap();
                assert_eq!(rssi_snr.rssi_dbm, -98);
                assert_eq!(rssi_snr.snr, 4.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_position_requests_are_ignored() {
        let position = Position {
            latitude_i: Some(481234567),
            longitude_i: Some(171234567),
            time: 1735157442,
            ..Default::default()
        };
        let data = Data {
            portnum: POSITION_APP,
            payload: position.encode_to_vec(),
            ..Default::default()
        };
        // Addressed to a specific node: a position request, not a fix
        let message = envelope(0xdeadbeef, 0, 0.0, 0x12345678, data.clone());
        assert_eq!(parse_status_envelope(&message), Some(MshStatusEvent::Ignored));

        let message = envelope(0xdeadbeef, -80, 6.5, BROADCAST, data);
        match parse_status_envelope(&message).unwrap() {
            MshStatusEvent::Position { position, .. } => {
                assert!((position.lat - 48.1234567).abs() < 1e-9);
                assert!((position.lon - 17.1234567).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_distance() {
        let bratislava = state::Position {
            lat: 48.1486,
            lon: 17.1077,
        };
        let pezinok = state::Position {
            lat: 48.2897,
            lon: 17.2664,
        };
        let distance = distance_m(bratislava, pezinok).unwrap();
        assert!((distance - 19_500.0).abs() < 1000.0, "got {distance}");
    }
}
