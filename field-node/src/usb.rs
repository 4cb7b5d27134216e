//! USB serial device watcher.
//!
//! Polls the serial port enumeration and diffs it against the known set,
//! turning appearances and disappearances into [`DeviceEvent`]s. Only two
//! device families are monitored: SportIdent readers (Silabs or WCH USB
//! bridges) and Meshtastic radios on CDC-ACM.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_serial::SerialPortType;
use tracing::{debug, warn};

/// SportIdent readers enumerate with one of these vendor ids.
pub const SI_VENDOR_IDS: [u16; 2] = [0x10c4, 0x1a86];

const POLL_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    SportIdent,
    MeshtasticSerial,
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub added: bool,
    pub tty_path: String,
    /// Stable identifier of the USB device (vid:pid plus serial number
    /// when the device reports one).
    pub usb_node: String,
    pub kind: DeviceKind,
}

fn classify(port_name: &str, vid: u16) -> Option<DeviceKind> {
    if SI_VENDOR_IDS.contains(&vid) {
        return Some(DeviceKind::SportIdent);
    }
    // The host controller itself never shows up in the port enumeration,
    // so any remaining ACM device is a Meshtastic candidate.
    if port_name.contains("ACM") {
        return Some(DeviceKind::MeshtasticSerial);
    }
    None
}

fn enumerate() -> HashMap<String, (String, DeviceKind)> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            warn!("Serial port enumeration failed: {err}");
            return HashMap::new();
        }
    };

    let mut current = HashMap::new();
    for port in ports {
        let SerialPortType::UsbPort(usb) = port.port_type else {
            continue;
        };
        let Some(kind) = classify(&port.port_name, usb.vid) else {
            continue;
        };
        let usb_node = match &usb.serial_number {
            Some(serial) => format!("{:04x}:{:04x}-{serial}", usb.vid, usb.pid),
            None => format!("{:04x}:{:04x}", usb.vid, usb.pid),
        };
        current.insert(port.port_name, (usb_node, kind));
    }
    current
}

/// Watches USB serial devices until the event channel closes.
pub async fn watch_devices(events: mpsc::Sender<DeviceEvent>) {
    let mut known: HashMap<String, (String, DeviceKind)> = HashMap::new();
    let mut ticker = tokio::time::interval(POLL_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let current = match tokio::task::spawn_blocking(enumerate).await {
            Ok(current) => current,
            Err(_) => continue,
        };

        for (tty_path, (usb_node, kind)) in &known {
            if !current.contains_key(tty_path) {
                debug!("Device removed: {tty_path}");
                let event = DeviceEvent {
                    added: false,
                    tty_path: tty_path.clone(),
                    usb_node: usb_node.clone(),
                    kind: *kind,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
        for (tty_path, (usb_node, kind)) in &current {
            if !known.contains_key(tty_path) {
                debug!("Device added: {tty_path}");
                let event = DeviceEvent {
                    added: true,
                    tty_path: tty_path.clone(),
                    usb_node: usb_node.clone(),
                    kind: *kind,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
        known = current;
    }
}

#[cfg(test)]
mod test_usb {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("/dev/ttyUSB0", 0x10c4), Some(DeviceKind::SportIdent));
        assert_eq!(classify("/dev/ttyACM1", 0x1a86), Some(DeviceKind::SportIdent));
        assert_eq!(
            classify("/dev/ttyACM0", 0x239a),
            Some(DeviceKind::MeshtasticSerial)
        );
        assert_eq!(classify("/dev/ttyUSB1", 0x0403), None);
    }
}
