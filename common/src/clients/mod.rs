//! Sink clients and the fan-out group.
//!
//! Every transport implements [`Client`]: an owned `run` lifecycle that
//! reconnects internally and never panics on transport failure, plus
//! `send_punch`/`send_status` returning a plain success flag. The
//! [`ClientGroup`] dispatches each punch to all sinks concurrently; a dead
//! sink costs its own result, never the others'.

mod mop;
mod mqtt;
mod roc;
mod serial;
mod sim7020_mqtt;
mod sirap;

pub use mop::{MeosCategory, MeosCompetitor, MeosResult, MopClient};
pub use mqtt::{MqttClient, MqttConfig};
pub use roc::RocClient;
pub use serial::SerialClient;
pub use sim7020_mqtt::Sim7020MqttClient;
pub use sirap::SirapClient;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::error;

use crate::proto::Status;
use crate::punch::SiPunchLog;
use crate::system_info::MacAddress;

#[async_trait]
pub trait Client: Send + Sync {
    /// The client's own lifecycle: connect, reconnect, serve. Runs for the
    /// lifetime of the process.
    async fn run(&self) -> crate::Result<()>;

    async fn send_punch(&self, punch: &SiPunchLog) -> bool;

    async fn send_status(&self, status: &Status, mac_address: &MacAddress) -> bool;
}

pub struct ClientGroup {
    clients: Vec<(String, Arc<dyn Client>)>,
}

impl ClientGroup {
    pub fn new(clients: Vec<(String, Arc<dyn Client>)>) -> Self {
        Self { clients }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Spawns every client's `run` loop as its own task, so one client
    /// going down cannot take the others with it.
    pub fn spawn_loops(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.clients
            .iter()
            .map(|(name, client)| {
                let name = name.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(err) = client.run().await {
                        error!("{name} client loop ended: {err}");
                    }
                })
            })
            .collect()
    }

    /// Sends the punch to all sinks concurrently. The result vector is in
    /// client order; failures are reported per sink, never as a whole.
    pub async fn send_punch(&self, punch: &SiPunchLog) -> Vec<bool> {
        let results =
            join_all(self.clients.iter().map(|(_, client)| client.send_punch(punch))).await;
        for ((name, _), sent) in self.clients.iter().zip(&results) {
            if !sent {
                error!("{name}: punch not sent");
            }
        }
        results
    }

    pub async fn send_status(&self, status: &Status, mac_address: &MacAddress) -> Vec<bool> {
        let results = join_all(
            self.clients.iter().map(|(_, client)| client.send_status(status, mac_address)),
        )
        .await;
        for ((name, _), sent) in self.clients.iter().zip(&results) {
            if !sent {
                error!("{name}: status not sent");
            }
        }
        results
    }
}
