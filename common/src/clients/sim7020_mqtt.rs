//! NB-IoT MQTT sink: the same topics as the broadband sink, but spoken
//! through the SIM7020 modem session, with punches going through the
//! batched retry scheduler so several punches share one `CMQPUB`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tracing::error;

use super::Client;
use crate::backoff::BackoffBatchedRetries;
use crate::proto::{status, Punch, Punches, Status};
use crate::punch::SiPunchLog;
use crate::sim7020::Sim7020;
use crate::system_info::MacAddress;
use crate::topics::Topics;

const PUNCH_BATCH_SIZE: usize = 4;
const FIRST_BACKOFF: Duration = Duration::from_secs(3);
const BACKOFF_MULTIPLIER: f64 = 2.0;
/// Punches are worth retrying for hours; NB-IoT outages routinely last
/// tens of minutes.
const SEND_PUNCH_DEADLINE: Duration = Duration::from_secs(3 * 60 * 60);

pub struct Sim7020MqttClient {
    sim7020: Arc<Sim7020>,
    topics: Topics,
    retries: BackoffBatchedRetries<Punch, bool>,
}

impl Sim7020MqttClient {
    pub fn new(sim7020: Arc<Sim7020>, mac_addr: MacAddress) -> Self {
        let topics = Topics::from_mac(&mac_addr);
        let punch_topic = topics.punch.clone();
        let sender = sim7020.clone();
        let retries = BackoffBatchedRetries::new(
            move |punches: Vec<Punch>| {
                let sim7020 = sender.clone();
                let topic = punch_topic.clone();
                async move {
                    let count = punches.len();
                    let message = Punches {
                        punches,
                        sending_timestamp: None,
                    };
                    match sim7020.mqtt_send(&topic, &message.encode_to_vec(), 1).await {
                        Ok(()) => Ok(vec![true; count]),
                        Err(err) => {
                            error!("Sending of punches failed: {err}");
                            Ok(vec![false; count])
                        }
                    }
                }
            },
            false,
            FIRST_BACKOFF,
            BACKOFF_MULTIPLIER,
            SEND_PUNCH_DEADLINE,
            PUNCH_BATCH_SIZE,
        );
        Self {
            sim7020,
            topics,
            retries,
        }
    }
}

#[async_trait]
impl Client for Sim7020MqttClient {
    async fn run(&self) -> crate::Result<()> {
        self.sim7020.setup().await;
        self.sim7020.mqtt_connect().await;
        std::future::pending().await
    }

    async fn send_punch(&self, punch_log: &SiPunchLog) -> bool {
        let punch = Punch {
            raw: punch_log.punch.raw.to_vec(),
        };
        self.retries.send(punch).await.unwrap_or(false)
    }

    async fn send_status(&self, status: &Status, _mac_address: &MacAddress) -> bool {
        let mut status = status.clone();
        if let Some(status::Msg::MiniCallHome(mch)) = &mut status.msg {
            if let Some(signal_info) = self.sim7020.signal_info().await {
                mch.signal_dbm = signal_info.dbm;
                mch.cellid = signal_info.cellid;
                mch.network_type = signal_info.network_type as i32;
            }
        }
        match self.sim7020.mqtt_send(&self.topics.status, &status.encode_to_vec(), 0).await {
            Ok(()) => true,
            Err(err) => {
                error!("MQTT sending of status failed: {err}");
                false
            }
        }
    }
}
