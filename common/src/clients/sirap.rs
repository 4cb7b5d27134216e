//! SIRAP sink: the compact TCP protocol MeOS consumes.
//!
//! One persistent connection, two record types. Everything little-endian,
//! times in tenths of a second since midnight.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use chrono::Timelike;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::Client;
use crate::proto::Status;
use crate::punch::SiPunchLog;
use crate::system_info::MacAddress;

const PUNCH: u8 = 0;
const CARD: u8 = 0x40;
const PUNCH_START: u32 = 1;
const PUNCH_FINISH: u32 = 2;
/// The "code day" field is always zero.
const CODE_DAY: [u8; 4] = [0; 4];

const RECONNECT_PERIOD: Duration = Duration::from_secs(20);

pub struct SirapClient {
    host: String,
    port: u16,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl SirapClient {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            writer: Mutex::new(None),
        }
    }

    async fn connect(&self) {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return;
        }
        match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(stream) => {
                info!("Connected to SIRAP endpoint {}:{}", self.host, self.port);
                let (_, write_half) = stream.into_split();
                *writer = Some(write_half);
            }
            Err(err) => error!("Error connecting to SIRAP endpoint: {err}"),
        }
    }

    fn time_to_bytes(daytime: NaiveTime) -> [u8; 4] {
        (daytime.num_seconds_from_midnight() * 10).to_le_bytes()
    }

    fn serialize_punch(card: u32, daytime: NaiveTime, code: u16) -> Vec<u8> {
        let mut message = vec![PUNCH];
        message.extend(code.to_le_bytes());
        message.extend(card.to_le_bytes());
        message.extend(CODE_DAY);
        message.extend(Self::time_to_bytes(daytime));
        message
    }

    fn serialize_card(
        card: u32,
        start: Option<NaiveTime>,
        finish: Option<NaiveTime>,
        punches: &[(u32, NaiveTime)],
    ) -> Vec<u8> {
        let punch_count =
            punches.len() + usize::from(start.is_some()) + usize::from(finish.is_some());
        let mut message = vec![CARD];
        message.extend((punch_count as u16).to_le_bytes());
        message.extend(card.to_le_bytes());
        message.extend(CODE_DAY);
        message.extend(Self::time_to_bytes(NaiveTime::default()));

        let mut card_punch = |code: u32, daytime: NaiveTime| {
            message.extend(code.to_le_bytes());
            message.extend(Self::time_to_bytes(daytime));
        };
        if let Some(start) = start {
            card_punch(PUNCH_START, start);
        }
        for (code, daytime) in punches {
            card_punch(*code, *daytime);
        }
        if let Some(finish) = finish {
            card_punch(PUNCH_FINISH, finish);
        }
        message
    }

    /// Sends a full card readout.
    pub async fn send_card(
        &self,
        card: u32,
        start: Option<NaiveTime>,
        finish: Option<NaiveTime>,
        punches: &[(u32, NaiveTime)],
    ) -> bool {
        self.send(&Self::serialize_card(card, start, finish, punches)).await
    }

    async fn send(&self, message: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            error!("SIRAP client not connected");
            return false;
        };
        if let Err(err) = write_half.write_all(message).await {
            error!("SIRAP write failed: {err}");
            // Force a reconnect on the next probe
            *writer = None;
            return false;
        }
        true
    }
}

#[async_trait]
impl Client for SirapClient {
    async fn run(&self) -> crate::Result<()> {
        loop {
            self.connect().await;
            tokio::time::sleep(RECONNECT_PERIOD).await;
        }
    }

    async fn send_punch(&self, punch: &SiPunchLog) -> bool {
        let punch = &punch.punch;
        let message = Self::serialize_punch(punch.card, punch.time.time(), punch.code);
        self.send(&message).await
    }

    async fn send_status(&self, _status: &Status, _mac_address: &MacAddress) -> bool {
        true
    }
}
