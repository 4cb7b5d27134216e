//! ROC sink: punches and telemetry to roc.olresultat.se.

use std::time::Duration;

use async_trait::async_trait;
use chrono::prelude::*;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::Client;
use crate::proto::{status, CellNetworkType, EventType, Status};
use crate::punch::SiPunchLog;
use crate::system_info::{format_ipv4, MacAddress, FREQ_MULTIPLIER};

const ROC_SEND_PUNCH: &str = "https://roc.olresultat.se/ver7.1/sendpunches_v2.php";
const ROC_RECEIVEDATA: &str = "https://roc.olresultat.se/ver7.1/receivedata.php";

const RETRY_ATTEMPTS: u32 = 5;
const FIRST_RETRY: Duration = Duration::from_secs(3);
/// Total time spent on one request including retries.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(50);

pub struct RocClient {
    client: reqwest::Client,
}

impl Default for RocClient {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("HTTP client construction does not fail with static options");
        Self { client }
    }
}

/// The number of decimal digits of `x`; 0 counts as one digit.
fn digit_count(x: u32) -> u32 {
    match x.checked_ilog10() {
        Some(log) => log + 1,
        None => 1,
    }
}

impl RocClient {
    /// POSTs/GETs with exponential-backoff retries, 5 attempts within 50 s.
    async fn send_with_retries(&self, request: reqwest::RequestBuilder) -> bool {
        let deadline = Instant::now() + TOTAL_TIMEOUT;
        let mut backoff = FIRST_RETRY;
        for attempt in 0..RETRY_ATTEMPTS {
            let Some(request) = request.try_clone() else {
                error!("ROC request cannot be retried");
                return false;
            };
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Got response {}", response.status());
                    return true;
                }
                Ok(response) => {
                    error!("ROC error {}", response.status());
                }
                Err(err) => error!("ROC error: {err}"),
            }
            let now = Instant::now();
            if attempt + 1 == RETRY_ATTEMPTS || now + backoff >= deadline {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        false
    }
}

#[async_trait]
impl Client for RocClient {
    async fn run(&self) -> crate::Result<()> {
        std::future::pending().await
    }

    async fn send_punch(&self, punch_log: &SiPunchLog) -> bool {
        let punch = &punch_log.punch;
        let now = Local::now();
        let mac_address = punch_log.host_info.mac_address.to_string();

        let length = 118
            + digit_count(u32::from(punch.code))
            + digit_count(punch.card)
            + digit_count(u32::from(punch.mode));
        let form = [
            ("control1", punch.code.to_string()),
            ("sinumber1", punch.card.to_string()),
            ("stationmode1", punch.mode.to_string()),
            ("date1", punch.time.format("%Y-%m-%d").to_string()),
            ("sitime1", punch.time.format("%H:%M:%S").to_string()),
            ("ms1", punch.time.format("%3f").to_string()),
            ("roctime1", now.format("%Y-%m-%d %H:%M:%S").to_string()),
            ("macaddr", mac_address),
            ("1", "f".to_owned()),
            ("length", length.to_string()),
        ];

        let request = self.client.post(ROC_SEND_PUNCH).form(&form);
        let sent = self.send_with_retries(request).await;
        if sent {
            info!("Punch sent to ROC");
        }
        sent
    }

    async fn send_status(&self, status: &Status, mac_address: &MacAddress) -> bool {
        let mac_address = mac_address.to_string();
        let params: Vec<(&str, String)> = match &status.msg {
            Some(status::Msg::MiniCallHome(mch)) => {
                let network_type = match mch.network_type() {
                    CellNetworkType::Lte => "101",
                    CellNetworkType::Umts => "41",
                    _ => "0",
                };
                vec![
                    ("function", "callhome".to_owned()),
                    ("command", "setmini".to_owned()),
                    ("macaddr", mac_address),
                    ("failedcallhomes", "0".to_owned()),
                    ("localipaddress", format_ipv4(mch.local_ip)),
                    ("codes", mch.codes.clone()),
                    ("totaldatatx", mch.totaldatatx.to_string()),
                    ("totaldatarx", mch.totaldatarx.to_string()),
                    ("signaldBm", (-mch.signal_dbm).to_string()),
                    ("temperature", mch.cpu_temperature.to_string()),
                    ("networktype", network_type.to_owned()),
                    ("volts", (f64::from(mch.millivolts) / 1000.0).to_string()),
                    ("freq", (mch.freq * FREQ_MULTIPLIER).to_string()),
                    ("minFreq", (mch.min_freq * FREQ_MULTIPLIER).to_string()),
                    ("maxFreq", (mch.max_freq * FREQ_MULTIPLIER).to_string()),
                ]
            }
            Some(status::Msg::DevEvent(dev_event)) => {
                let codes = match dev_event.r#type() {
                    EventType::Added => format!("siadded-{}", dev_event.port),
                    EventType::Removed => format!("siremoved-{}", dev_event.port),
                };
                vec![
                    ("function", "callhome".to_owned()),
                    ("command", "setmini".to_owned()),
                    ("macaddr", mac_address),
                    ("failedcallhomes", "0".to_owned()),
                    ("codes", codes),
                ]
            }
            _ => return true,
        };

        let request = self.client.get(ROC_RECEIVEDATA).query(&params);
        let sent = self.send_with_retries(request).await;
        if sent {
            info!("MiniCallHome sent to ROC");
        }
        sent
    }
}

#[cfg(test)]
mod test_roc {
    use super::*;

    #[test]
    fn test_digit_count() {
        assert_eq!(digit_count(0), 1);
        assert_eq!(digit_count(9), 1);
        assert_eq!(digit_count(10), 2);
        assert_eq!(digit_count(46283), 5);
        assert_eq!(digit_count(1715004), 7);
    }

    #[test]
    fn test_length_field() {
        // length = 118 + digits(code) + digits(card) + digits(mode)
        let length =
            118 + digit_count(47) + digit_count(1715004) + digit_count(2);
        assert_eq!(length, 128);

        let length = 118 + digit_count(0) + digit_count(0) + digit_count(0);
        assert_eq!(length, 121);
    }
}
