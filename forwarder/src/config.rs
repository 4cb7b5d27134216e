//! `mqtt-forwarder.toml` model and sink assembly.
//!
//! The forwarder assembles the same sink set as the field node minus the
//! NB-IoT uplink, which makes no sense behind a broadband connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveTime;
use serde::Deserialize;

use punchgate_common::clients::{
    Client, ClientGroup, MopClient, MqttClient, MqttConfig, RocClient, SerialClient, SirapClient,
};
use punchgate_common::system_info::MacAddress;

fn default_log_level() -> String {
    "punchgate=info".to_owned()
}

fn default_broker_url() -> String {
    MqttConfig::default().broker_url
}

fn default_broker_port() -> u16 {
    MqttConfig::default().broker_port
}

fn default_main_channel() -> String {
    "main".to_owned()
}

fn default_mop_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Node name to MAC address; 12 hex digits subscribe the cellular
    /// topics, 8 hex digits the Meshtastic passthrough topics.
    #[serde(rename = "mac-addresses", default)]
    pub mac_addresses: HashMap<String, String>,
    #[serde(default)]
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub client: Clients,
}

#[derive(Debug, Deserialize)]
pub struct MeshtasticConfig {
    #[serde(default = "default_main_channel")]
    pub main_channel: String,
    /// Punches from the radio mesh are attributed to this MAC.
    pub gateway_mac: Option<String>,
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            main_channel: default_main_channel(),
            gateway_mac: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Clients {
    pub serial: Option<SerialConfig>,
    pub sirap: Option<SirapConfig>,
    pub mop: Option<MopConfig>,
    pub mqtt: Option<MqttTomlConfig>,
    pub roc: Option<RocConfig>,
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

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {path}"))?;
        toml::from_str(&text).with_context(|| format!("Invalid config file {path}"))
    }

    /// Name resolution table, MAC-keyed.
    pub fn dns(&self) -> anyhow::Result<HashMap<MacAddress, String>> {
        self.mac_addresses
            .iter()
            .map(|(name, mac)| {
                let mac: MacAddress = mac
                    .parse()
                    .with_context(|| format!("Invalid MAC address for {name}"))?;
                Ok((mac, name.clone()))
            })
            .collect()
    }
}

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

    Ok(ClientGroup::new(clients))
}

#[cfg(test)]
mod test_config {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
broker_url = "broker.emqx.io"

[mac-addresses]
spe01 = "abcdef012345"
radio1 = "deadbeef"

[meshtastic]
main_channel = "paper"
gateway_mac = "abcdef012345"

[client.roc]
enable = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.broker_url, "broker.emqx.io");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.meshtastic.main_channel, "paper");
        assert!(config.client.roc.as_ref().unwrap().enable);

        let dns = config.dns().unwrap();
        assert_eq!(dns.len(), 2);
        let radio: MacAddress = "deadbeef".parse().unwrap();
        assert_eq!(dns.get(&radio), Some(&"radio1".to_owned()));
    }

    #[test]
    fn test_invalid_mac_is_fatal() {
        let toml = r#"
[mac-addresses]
broken = "zzz"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.dns().is_err());
    }
}
