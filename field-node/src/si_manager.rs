//! SportIdent reader management.
//!
//! One reader task per attached device, all feeding the shared punch
//! queue. A bad frame is logged and skipped; only a serial error or EOF
//! ends a reader task, and even that never touches the other readers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info};

use punchgate_common::punch::{SiPunch, BEACON_CONTROL};
use punchgate_common::system_info::MacAddress;

use crate::usb::{DeviceEvent, DeviceKind};

/// Time for the kernel to finish setting up a freshly plugged TTY.
const SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Cap on buffered garbage between frames.
const PENDING_LIMIT: usize = 4096;

/// Bounded punch queue between the readers and the fan-out. SI events are
/// low-rate; an overflow signals a stuck consumer, so the oldest punch is
/// dropped and the drop is loud.
pub struct PunchQueue {
    punches: StdMutex<std::collections::VecDeque<SiPunch>>,
    notify: Notify,
    capacity: usize,
}

impl PunchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            punches: StdMutex::new(std::collections::VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, punch: SiPunch) {
        {
            let mut punches = self.punches.lock().unwrap();
            if punches.len() >= self.capacity {
                let dropped = punches.pop_front();
                error!(
                    "Punch queue overflow, dropping punch of card {}",
                    dropped.map(|p| p.card).unwrap_or_default()
                );
            }
            punches.push_back(punch);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> SiPunch {
        loop {
            if let Some(punch) = self.punches.lock().unwrap().pop_front() {
                return punch;
            }
            self.notify.notified().await;
        }
    }
}

/// The set of control codes seen across all readers, for status reports.
#[derive(Clone, Default)]
pub struct CodesSnapshot {
    codes: Arc<StdMutex<BTreeSet<u16>>>,
}

impl CodesSnapshot {
    fn insert(&self, code: u16) {
        self.codes.lock().unwrap().insert(code);
    }

    pub fn to_codes_string(&self) -> String {
        let codes = self.codes.lock().unwrap();
        if codes.is_empty() {
            return String::new();
        }
        let joined: Vec<String> = codes.iter().map(u16::to_string).collect();
        format!("{}-srr", joined.join(","))
    }
}

/// Serializes add/remove handling so an add is never concurrent with its
/// own remove. Reader tasks are keyed by USB node; there is at most one
/// per node at any time.
pub async fn run(
    mut device_events: mpsc::Receiver<DeviceEvent>,
    dev_event_tx: mpsc::Sender<DeviceEvent>,
    queue: Arc<PunchQueue>,
    codes: CodesSnapshot,
    mac_addr: MacAddress,
) {
    info!("Starting the SportIdent device manager");
    let mut readers: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(event) = device_events.recv().await {
        match event.kind {
            DeviceKind::SportIdent => {
                if event.added {
                    if readers.contains_key(&event.usb_node) {
                        continue;
                    }
                    info!("Inserted SportIdent device {}", event.tty_path);
                    let handle = tokio::spawn(reader_task(
                        event.tty_path.clone(),
                        mac_addr,
                        queue.clone(),
                        codes.clone(),
                    ));
                    readers.insert(event.usb_node.clone(), handle);
                } else if let Some(handle) = readers.remove(&event.usb_node) {
                    info!("Removed SportIdent device {}", event.tty_path);
                    handle.abort();
                }
            }
            DeviceKind::MeshtasticSerial => {
                if event.added {
                    info!("Detected Meshtastic serial device {}", event.tty_path);
                }
            }
        }
        if dev_event_tx.send(event).await.is_err() {
            return;
        }
    }
}

async fn reader_task(
    tty_path: String,
    mac_addr: MacAddress,
    queue: Arc<PunchQueue>,
    codes: CodesSnapshot,
) {
    tokio::time::sleep(SETTLE_DELAY).await;
    let stream = tokio_serial::new(&tty_path, 38400).open_native_async();
    match stream {
        Ok(stream) => {
            info!("Connected to SI reader at {tty_path}");
            if let Err(err) = process_stream(stream, mac_addr, &queue, &codes).await {
                error!("SI reader at {tty_path} failed: {err}");
            }
        }
        Err(err) => error!("Error connecting to {tty_path}: {err}"),
    }
}

/// Scans the byte stream for punch frames. CRC failures and framing
/// errors drop the frame, nothing more.
async fn process_stream<S: AsyncRead + Unpin>(
    mut stream: S,
    mac_addr: MacAddress,
    queue: &PunchQueue,
    codes: &CodesSnapshot,
) -> punchgate_common::Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);

        while let Some((raw, rest)) = SiPunch::find_punch_data(&pending) {
            let rest = rest.to_vec();
            match SiPunch::check_frame(&raw) {
                Ok(()) => {
                    let now = Local::now().fixed_offset();
                    let punch = SiPunch::from_raw(raw, mac_addr, &now);
                    codes.insert(punch.code);
                    info!(
                        "{punch}, received after {:.2}s",
                        (now - punch.time).num_milliseconds() as f64 / 1000.0
                    );
                    queue.push(punch);
                }
                Err(err) => error!("Failed to decode punch: {err}"),
            }
            pending = rest;
        }
        if pending.len() > PENDING_LIMIT {
            pending.clear();
        }
    }
}

/// Fake punch source for benchmarks and tests: card 46283 punches an
/// incrementing control every 12 seconds.
pub async fn fake_punches(queue: Arc<PunchQueue>, mac_addr: MacAddress) {
    let punch_interval = Duration::from_secs(12);
    info!(
        "Starting a fake SportIdent device manager, sending a punch every {} seconds",
        punch_interval.as_secs()
    );
    let mut interval = tokio::time::interval(punch_interval);
    for i in 31u16..1000 {
        interval.tick().await;
        let now = Local::now().fixed_offset();
        queue.push(SiPunch::new(46283, (i + 1) % 1000, now, BEACON_CONTROL, mac_addr));
    }
}

#[cfg(test)]
mod test_si_manager {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_process_stream() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let queue = Arc::new(PunchQueue::new(8));
        let codes = CodesSnapshot::default();

        let reader = {
            let queue = queue.clone();
            let codes = codes.clone();
            tokio::spawn(async move {
                process_stream(rx, MacAddress::default(), &queue, &codes).await
            })
        };

        let good =
            b"\xff\x02\xd3\x0d\x00\x2f\x00\x1a\x2b\x3c\x08\x8c\xa3\xcb\x02\x00\x01\x50\xe3\x03";
        let mut corrupted = *good;
        corrupted[8] ^= 0xff;
        // One valid frame, one with a broken checksum, then another valid
        // frame split across two writes
        tx.write_all(good).await.unwrap();
        tx.write_all(&corrupted).await.unwrap();
        tx.write_all(&good[..7]).await.unwrap();
        tx.write_all(&good[7..]).await.unwrap();
        drop(tx);

        let punch = queue.pop().await;
        assert_eq!(punch.card, 1715004);
        assert_eq!(punch.code, 47);
        let punch = queue.pop().await;
        assert_eq!(punch.card, 1715004);
        assert_eq!(codes.to_codes_string(), "47-srr");

        // EOF ends the task cleanly, the corrupted frame was only logged
        assert!(reader.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest() {
        let queue = PunchQueue::new(2);
        let now = Local::now().fixed_offset();
        for code in [1u16, 2, 3] {
            queue.push(SiPunch::new(46283, code, now, BEACON_CONTROL, MacAddress::default()));
        }
        assert_eq!(queue.pop().await.code, 2);
        assert_eq!(queue.pop().await.code, 3);
    }

    #[tokio::test]
    async fn test_reader_registry() {
        let (device_tx, device_rx) = mpsc::channel(8);
        let (dev_event_tx, mut dev_event_rx) = mpsc::channel(8);
        let queue = Arc::new(PunchQueue::new(8));
        let manager = tokio::spawn(run(
            device_rx,
            dev_event_tx,
            queue,
            CodesSnapshot::default(),
            MacAddress::default(),
        ));

        let added = DeviceEvent {
            added: true,
            tty_path: "/dev/null".to_owned(),
            usb_node: "10c4:800a-1".to_owned(),
            kind: DeviceKind::SportIdent,
        };
        device_tx.send(added.clone()).await.unwrap();
        let forwarded = dev_event_rx.recv().await.unwrap();
        assert!(forwarded.added);
        assert_eq!(forwarded.usb_node, "10c4:800a-1");

        let removed = DeviceEvent {
            added: false,
            ..added
        };
        device_tx.send(removed).await.unwrap();
        let forwarded = dev_event_rx.recv().await.unwrap();
        assert!(!forwarded.added);

        // Closing the device channel ends the manager
        drop(device_tx);
        manager.await.unwrap();
    }
}
