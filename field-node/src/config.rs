//! `send-punch.toml` model and sink assembly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveTime;
use serde::Deserialize;
use tracing::error;

use punchgate_common::at::AtEngine;
use punchgate_common::clients::{
    Client, ClientGroup, MopClient, MqttClient, MqttConfig, RocClient, SerialClient,
    Sim7020MqttClient, SirapClient,
};
use punchgate_common::sim7020::{HostClock, Sim7020, Sim7020Config};
use punchgate_common::system_info::MacAddress;
use punchgate_common::topics::Topics;

fn default_log_level() -> String {
    "punchgate=info".to_owned()
}

fn default_si_punches() -> String {
    "udev".to_owned()
}

fn default_broker_url() -> String {
    punchgate_common::clients::MqttConfig::default().broker_url
}

fn default_broker_port() -> u16 {
    punchgate_common::clients::MqttConfig::default().broker_port
}

fn default_apn() -> String {
    "internet.iot".to_owned()
}

fn default_connect_timeout() -> u64 {
    45
}

fn default_mop_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub mac_addr: Option<String>,
    pub hostname: Option<String>,
    /// Punch source: "udev" reads attached USB devices, "fake" generates
    /// test punches.
    #[serde(default = "default_si_punches")]
    pub si_punches: String,
    /// Newer-style source selection; takes precedence over `si_punches`.
    pub punch_source: Option<PunchSources>,
    #[serde(default)]
    pub client: Clients,
}

#[derive(Debug, Default, Deserialize)]
pub struct PunchSources {
    pub usb: Option<PunchSource>,
    pub fake: Option<PunchSource>,
    pub bt: Option<PunchSource>,
}

#[derive(Debug, Deserialize)]
pub struct PunchSource {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct Clients {
    pub serial: Option<SerialConfig>,
    pub sirap: Option<SirapConfig>,
    pub mop: Option<MopConfig>,
    pub mqtt: Option<MqttTomlConfig>,
    pub roc: Option<RocConfig>,
    pub sim7020: Option<Sim7020TomlConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SerialConfig {
    #[serde(default)]
    pub enable: bool,
    pub port: String,
}

#[derive(Debug, Deserialize)]
pub struct SirapConfig {
    #[serde(default)]
    pub enable: bool,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct MopConfig {
    #[serde(default)]
    pub enable: bool,
    pub api_key: String,
    pub mop_xml: Option<PathBuf>,
    /// First start of the day, used when a finish punch arrives for a
    /// competitor without a recorded start.
    #[serde(default = "default_mop_start_time")]
    pub start_time: NaiveTime,
}

#[derive(Debug, Deserialize)]
pub struct MqttTomlConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct RocConfig {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Deserialize)]
pub struct Sim7020TomlConfig {
    #[serde(default)]
    pub enable: bool,
    pub device: String,
    #[serde(default = "default_apn")]
    pub apn: String,
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {path}"))?;
        toml::from_str(&text).with_context(|| format!("Invalid config file {path}"))
    }

    /// The effective punch source. `punch_source` wins over the older
    /// `si_punches` string; Bluetooth readers are not supported.
    pub fn punch_source_kind(&self) -> anyhow::Result<&str> {
        if let Some(sources) = &self.punch_source {
            if sources.bt.as_ref().is_some_and(|source| source.enable) {
                anyhow::bail!("Bluetooth punch sources are not supported");
            }
            if sources.fake.as_ref().is_some_and(|source| source.enable) {
                return Ok("fake");
            }
            if sources.usb.as_ref().is_some_and(|source| source.enable) {
                return Ok("udev");
            }
        }
        match self.si_punches.as_str() {
            source @ ("udev" | "fake") => Ok(source),
            other => anyhow::bail!("Unknown si_punches source: {other}"),
        }
    }
}

/// Builds the enabled sinks. A sink whose device cannot be opened is
/// skipped with an error; a broken config is fatal.
pub fn create_clients(
    config: &Clients,
    mac_addr: MacAddress,
    hostname: &str,
) -> anyhow::Result<ClientGroup> {
    let mut clients: Vec<(String, Arc<dyn Client>)> = Vec::new();

    if let Some(serial) = config.serial.as_ref().filter(|c| c.enable) {
        clients.push((
            "serial".to_owned(),
            Arc::new(SerialClient::new(serial.port.clone())),
        ));
    }
    if let Some(sirap) = config.sirap.as_ref().filter(|c| c.enable) {
        clients.push((
            "sirap".to_owned(),
            Arc::new(SirapClient::new(sirap.ip.clone(), sirap.port)),
        ));
    }
    if let Some(mop) = config.mop.as_ref().filter(|c| c.enable) {
        clients.push((
            "mop".to_owned(),
            Arc::new(MopClient::new(
                mop.api_key.clone(),
                mop.mop_xml.as_deref(),
                mop.start_time,
            )),
        ));
    }
    if let Some(mqtt) = config.mqtt.as_ref().filter(|c| c.enable) {
        let mqtt_config = MqttConfig {
            broker_url: mqtt.broker_url.clone(),
            broker_port: mqtt.broker_port,
            ..MqttConfig::default()
        };
        clients.push((
            "mqtt".to_owned(),
            Arc::new(MqttClient::new(hostname, mac_addr, mqtt_config)),
        ));
    }
    if config.roc.as_ref().is_some_and(|c| c.enable) {
        clients.push(("roc".to_owned(), Arc::new(RocClient::default())));
    }
    if let Some(sim7020) = config.sim7020.as_ref().filter(|c| c.enable) {
        match AtEngine::from_serial(&sim7020.device) {
            Ok(engine) => {
                let topics = Topics::from_mac(&mac_addr);
                let sim_config = Sim7020Config {
                    client_name: format!("SIM7020-{mac_addr}"),
                    will_topic: topics.status,
                    broker_url: sim7020.broker_url.clone(),
                    broker_port: sim7020.broker_port,
                    apn: sim7020.apn.clone(),
                    connect_timeout: Duration::from_secs(sim7020.connect_timeout_secs),
                };
                let session = Sim7020::start(engine, sim_config, Box::new(HostClock));
                clients.push((
                    "sim7020".to_owned(),
                    Arc::new(Sim7020MqttClient::new(session, mac_addr)),
                ));
            }
            Err(err) => {
                error!("Error while initializing AT port {}: {err}", sim7020.device);
            }
        }
    }

    Ok(ClientGroup::new(clients))
}

#[cfg(test)]
mod test_config {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
log_level = "punchgate=debug"
mac_addr = "abcdef012345"
si_punches = "fake"

[client.sirap]
enable = true
ip = "192.168.1.10"
port = 10000

[client.mop]
enable = true
api_key = "secret"
start_time = "09:30:00"

[client.sim7020]
enable = false
device = "/dev/ttyAMA0"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.si_punches, "fake");
        let sirap = config.client.sirap.unwrap();
        assert!(sirap.enable);
        assert_eq!(sirap.port, 10000);
        let mop = config.client.mop.unwrap();
        assert_eq!(mop.start_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert!(!config.client.sim7020.unwrap().enable);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.si_punches, "udev");
        assert_eq!(config.log_level, "punchgate=info");
        assert!(config.client.mqtt.is_none());
        assert_eq!(config.punch_source_kind().unwrap(), "udev");
    }

    #[test]
    fn test_punch_source_table_wins() {
        let toml = r#"
si_punches = "udev"

[punch_source.fake]
enable = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.punch_source_kind().unwrap(), "fake");

        let config: Config = toml::from_str("[punch_source.bt]\nenable = true\n").unwrap();
        assert!(config.punch_source_kind().is_err());
    }
}
