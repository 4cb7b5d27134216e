//! Broadband MQTT sink.
//!
//! Publishes `Punches` on `yar/<mac>/p` (qos 1) and `Status` on
//! `yar/<mac>/status`, with a serialized `Disconnected` status installed
//! as the last will. Subscribes to `yar/<mac>/cmd`; commands are logged,
//! processing is intentionally not implemented.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use prost::Message;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tracing::{error, info};

use super::Client;
use crate::proto::{status, Disconnected, Punches, Status};
use crate::punch::SiPunchLog;
use crate::system_info::MacAddress;
use crate::topics::Topics;

pub const BROKER_URL: &str = "broker.hivemq.com";
pub const BROKER_PORT: u16 = 1883;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_url: String,
    pub broker_port: u16,
    pub keepalive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: BROKER_URL.to_owned(),
            broker_port: BROKER_PORT,
            keepalive: Duration::from_secs(30),
        }
    }
}

pub struct MqttClient {
    client: AsyncClient,
    event_loop: Mutex<EventLoop>,
    topics: Topics,
    name: String,
}

impl MqttClient {
    pub fn new(hostname: &str, mac_addr: MacAddress, config: MqttConfig) -> Self {
        let name = format!("pgate-{hostname}");
        let topics = Topics::from_mac(&mac_addr);

        let will = Status {
            msg: Some(status::Msg::Disconnected(Disconnected {
                client_name: name.clone(),
            })),
        };
        let mut options = MqttOptions::new(&name, &config.broker_url, config.broker_port);
        options.set_keep_alive(config.keepalive);
        options.set_clean_session(false);
        options.set_last_will(LastWill::new(
            &topics.status,
            will.encode_to_vec(),
            QoS::AtLeastOnce,
            false,
        ));

        let (client, event_loop) = AsyncClient::new(options, 100);
        Self {
            client,
            event_loop: Mutex::new(event_loop),
            topics,
            name,
        }
    }

    async fn publish(&self, topic: &str, message: Vec<u8>, qos: QoS, message_type: &str) -> bool {
        match self.client.publish(topic, qos, false, message).await {
            Ok(()) => {
                info!("{message_type} sent via MQTT");
                true
            }
            Err(err) => {
                error!("{message_type} not sent: {err}");
                false
            }
        }
    }
}

#[async_trait]
impl Client for MqttClient {
    async fn run(&self) -> crate::Result<()> {
        let mut event_loop = self.event_loop.lock().await;
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("{} connected to the MQTT broker", self.name);
                    // Subscriptions do not survive a reconnect
                    if let Err(err) =
                        self.client.subscribe(&self.topics.command, QoS::AtLeastOnce).await
                    {
                        error!("Failed to subscribe to the command topic: {err}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    info!(
                        "Got a command message on {}, processing is not implemented",
                        publish.topic
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    error!("MQTT connection error: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn send_punch(&self, punch_log: &SiPunchLog) -> bool {
        let punches = Punches {
            punches: vec![crate::proto::Punch {
                raw: punch_log.punch.raw.to_vec(),
            }],
            sending_timestamp: Some(crate::proto::timestamp(Utc::now())),
        };
        self.publish(&self.topics.punch, punches.encode_to_vec(), QoS::AtLeastOnce, "Punch")
            .await
    }

    async fn send_status(&self, status: &Status, mac_address: &MacAddress) -> bool {
        let topics = Topics::from_mac(mac_address);
        let qos = match status.msg {
            Some(status::Msg::MiniCallHome(_)) => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        };
        self.publish(&topics.status, status.encode_to_vec(), qos, "Status").await
    }
}
