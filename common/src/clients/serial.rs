//! Serial sink emulating an SRR dongle.
//!
//! Orienteering software probes the dongle with a handshake; we answer
//! with a canned identification and, for MeOS, a canned station config
//! readout. After that, every punch is written out as its raw 20-byte
//! frame as if a real dongle had received it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{error, info};

use super::Client;
use crate::proto::Status;
use crate::punch::SiPunchLog;
use crate::system_info::MacAddress;

const HANDSHAKE: &[u8] = b"\xff\x02\x02\xf0\x01Mm\n\x03";
const HANDSHAKE_REPLY: &[u8] = b"\xff\x02\xf0\x03\x12\x8cMb?\x03";
const MEOS_PROBE: &[u8] = b"\x02\x83\x02\x00\x80\xbf\x17\x03";
/// Canned station config readout that satisfies MeOS.
const MEOS_REPLY: &[u8] =
    b"\xff\x02\x83\x83\x12\x8c\x00\r\x00\x12\x8c\x04450\x16\x0b\x0fo!\xff\xff\
\xff\x02\x06\x00\x1b\x17?\x18\x18\x06)\x08\x05>\xfe\n\xeb\n\xeb\xff\xff\
\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\x92\xba\x1aB\x01\xff\xff\
\xe1\xff\xff\xff\xff\xff\x01\x01\x01\x0b\x07\x0c\x00\r]\x0eD\x0f\xec\x10-\
\x11;\x12s\x13#\x14;\x15\x01\x19\x1d\x1a\x1c\x1b\xc7\x1c\x00\x1d\xb0!\xb6\
\"\x10#\xea$\n%\x00&\x11,\x88-1.\x0b\xff\xff\xff\xff\xff\xff\xff\xff\xff\
\xff\xff\xff\xff\xff\xf9\xc3\x03";

const RECONNECT_PERIOD: Duration = Duration::from_secs(20);

pub struct SerialClient {
    port: String,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
}

impl SerialClient {
    pub fn new(port: String) -> Self {
        Self {
            port,
            writer: Mutex::new(None),
        }
    }

    async fn serve(&self, read_half: ReadHalf<SerialStream>) {
        let mut reader = BufReader::new(read_half);
        let mut data = Vec::new();
        loop {
            data.clear();
            match reader.read_until(0x03, &mut data).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if data == HANDSHAKE {
                info!("Responding to orienteering software");
                if !self.write(HANDSHAKE_REPLY).await {
                    return;
                }
            } else if data == MEOS_PROBE {
                if !self.write(MEOS_REPLY).await {
                    return;
                }
            }
        }
    }

    async fn write(&self, message: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            error!("Serial client not connected");
            return false;
        };
        if let Err(err) = write_half.write_all(message).await {
            error!("Fatal serial error: {err}");
            *writer = None;
            return false;
        }
        true
    }
}

#[async_trait]
impl Client for SerialClient {
    async fn run(&self) -> crate::Result<()> {
        loop {
            let stream = tokio_serial::new(&self.port, 38400).open_native_async();
            match stream {
                Ok(stream) => {
                    info!("Connected to SRR sink at {}", self.port);
                    let (read_half, write_half) = tokio::io::split(stream);
                    *self.writer.lock().await = Some(write_half);
                    self.serve(read_half).await;
                    *self.writer.lock().await = None;
                }
                Err(err) => error!("Error connecting to {}: {err}", self.port),
            }
            tokio::time::sleep(RECONNECT_PERIOD).await;
        }
    }

    async fn send_punch(&self, punch: &SiPunchLog) -> bool {
        if self.write(&punch.punch.raw).await {
            info!("Punch sent via serial port");
            return true;
        }
        false
    }

    async fn send_status(&self, _status: &Status, _mac_address: &MacAddress) -> bool {
        true
    }
}
