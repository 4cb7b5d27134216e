//! NB-IoT MQTT session over a SIM7020 modem.
//!
//! A cooperative state machine on top of the [`crate::at`] engine. The
//! session id lives in [`MqttId`]: `Connected(k)` means a broker session
//! observed within the keepalive window, anything else is a
//! `Disconnected(reason)` that the next send will try to repair.
//!
//! Recovery ladder:
//! 1. keepalive exceeded since the last successful publish: the session is
//!    not trusted, reconnect;
//! 2. [`RESTART_TIME`] exceeded: radio off/on via `AT+CFUN`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::prelude::*;
use prost::Message;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::at::{AtEngine, DEFAULT_TIMEOUT};
use crate::error::Error;
use crate::proto::{status, CellNetworkType, Disconnected, Status};
use crate::system_info::CellSignalInfo;

/// Radio restart threshold: modem silent for this long gets `AT+CFUN=0/1`.
pub const RESTART_TIME: Duration = Duration::from_secs(40 * 60);
/// `AT+CMQNEW` can take very long on a bad cell.
const CMQNEW_TIMEOUT: Duration = Duration::from_secs(153);
const CFUN_TIMEOUT: Duration = Duration::from_secs(10);

/// The MQTT session id of the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttId {
    Connected(u8),
    Disconnected(String),
}

/// Hand-off of the modem clock to the host. A seam so the session machine
/// stays testable without touching the host clock.
#[async_trait]
pub trait ClockSync: Send + Sync {
    async fn set(&self, time: DateTime<Utc>);
}

/// Sets the host clock via `sudo -n date -s`.
pub struct HostClock;

#[async_trait]
impl ClockSync for HostClock {
    async fn set(&self, time: DateTime<Utc>) {
        let formatted = time.to_rfc3339();
        match tokio::process::Command::new("sudo")
            .args(["-n", "date", "-s", &formatted])
            .status()
            .await
        {
            Ok(status) if status.success() => info!("Host clock set to {formatted}"),
            Ok(status) => error!("Setting host clock failed: {status}"),
            Err(err) => error!("Setting host clock failed: {err}"),
        }
    }
}

pub struct Sim7020Config {
    pub client_name: String,
    pub will_topic: String,
    pub broker_url: String,
    pub broker_port: u16,
    pub apn: String,
    pub connect_timeout: Duration,
}

impl Sim7020Config {
    fn keepalive(&self) -> Duration {
        2 * self.connect_timeout
    }
}

struct SessionState {
    mqtt_id: MqttId,
    /// When the current session id was (re)established.
    id_timestamp: Option<Instant>,
    /// Last successful publish; liveness and restart decisions key off it.
    last_success: Instant,
}

/// Lock order is always state, then the AT engine; the URC dispatch inside
/// the engine never takes the state lock itself.
pub struct Sim7020 {
    at: AtEngine,
    config: Sim7020Config,
    will: Vec<u8>,
    state: Mutex<SessionState>,
    clock: Box<dyn ClockSync>,
}

impl Sim7020 {
    /// Registers the unsolicited-line handlers on the engine and spawns
    /// the task reacting to them.
    pub fn start(
        mut at: AtEngine,
        config: Sim7020Config,
        clock: Box<dyn ClockSync>,
    ) -> Arc<Self> {
        let clts = at.add_urc_channel("+CLTS:");
        let cereg = at.add_urc_channel("+CEREG: 1,\"");
        let discon = at.add_urc_channel("+CMQDISCON:");
        let counters = at.add_urc_channel("*MGCOUNT:");

        let will = Status {
            msg: Some(status::Msg::Disconnected(Disconnected {
                client_name: config.client_name.clone(),
            })),
        }
        .encode_to_vec();

        let this = Arc::new(Self {
            at,
            config,
            will,
            state: Mutex::new(SessionState {
                mqtt_id: MqttId::Disconnected("Not connected yet".to_owned()),
                id_timestamp: None,
                last_success: Instant::now(),
            }),
            clock,
        });
        tokio::spawn(Self::urc_loop(this.clone(), clts, cereg, discon, counters));
        this
    }

    async fn urc_loop(
        this: Arc<Self>,
        mut clts: mpsc::Receiver<String>,
        mut cereg: mpsc::Receiver<String>,
        mut discon: mpsc::Receiver<String>,
        mut counters: mpsc::Receiver<String>,
    ) {
        loop {
            tokio::select! {
                Some(_) = clts.recv() => this.mqtt_connect().await,
                Some(_) = cereg.recv() => this.mqtt_connect().await,
                Some(line) = discon.recv() => {
                    warn!("MQTT disconnected:{line}");
                    let mut state = this.state.lock().await;
                    state.mqtt_id = MqttId::Disconnected("Disconnected".to_owned());
                    state.id_timestamp = None;
                }
                Some(line) = counters.recv() => Self::log_counters(&line),
                else => return,
            }
        }
    }

    fn log_counters(line: &str) {
        let parsed: Vec<Option<u64>> =
            line.trim().split(',').take(5).map(|x| x.parse().ok()).collect();
        match parsed.as_slice() {
            [_, _, Some(uplink), _, Some(downlink)] => {
                debug!("Uploaded: {uplink} bytes, downloaded: {downlink} bytes");
            }
            _ => error!("Failed to parse as traffic counters: {line}"),
        }
    }

    /// Power-on probe and session defaults.
    pub async fn setup(&self) {
        self.power_on().await;
        self.at.call("ATE0", DEFAULT_TIMEOUT).await;
        // Text error messages
        self.at.call("AT+CMEE=2", DEFAULT_TIMEOUT).await;
        // Hex message payloads
        self.at.call("AT+CREVHEX=1", DEFAULT_TIMEOUT).await;
        // Synchronous MQTT
        self.at.call("AT+CMQTSYNC=1", DEFAULT_TIMEOUT).await;
        // Time synchronization from the network
        self.at.call("AT+CLTS=1", DEFAULT_TIMEOUT).await;
        let command = format!("AT*MCGDEFCONT=\"IP\",\"{}\"", self.config.apn);
        let response = self.at.call(&command, self.config.connect_timeout).await;
        if !response.success {
            warn!("Can not set APN");
        }
    }

    async fn power_on(&self) {
        self.at.call("ATE0", Duration::from_secs(1)).await;
        let res = self.at.call("AT", Duration::from_secs(1)).await;
        if res.success {
            info!("SIM7020 is powered on");
            return;
        }
        info!("Powering on SIM7020");
        if let Err(err) = Self::toggle_power_key().await {
            // Only the Raspberry Pi carrier exposes the power key GPIO
            error!("Cannot toggle the power key ({err}), press the power button");
        }
    }

    async fn toggle_power_key() -> std::io::Result<()> {
        tokio::task::spawn_blocking(|| {
            // Power key is wired to GPIO 4 on the carrier board
            let _ = std::fs::write("/sys/class/gpio/export", "4");
            std::fs::write("/sys/class/gpio/gpio4/direction", "out")?;
            std::fs::write("/sys/class/gpio/gpio4/value", "1")?;
            std::thread::sleep(Duration::from_secs(1));
            std::fs::write("/sys/class/gpio/gpio4/value", "0")?;
            std::thread::sleep(Duration::from_secs(5));
            Ok(())
        })
        .await
        .map_err(|err| std::io::Error::other(err))?
    }

    pub async fn mqtt_disconnect(&self, mqtt_id: u8) {
        let timeout = self.config.keepalive() + Duration::from_secs(10);
        self.at.call(&format!("AT+CMQDISCON={mqtt_id}"), timeout).await;
    }

    async fn detect_mqtt_id(&self, state: &mut SessionState) -> MqttId {
        // A connection made recently is trusted as-is
        if let Some(timestamp) = state.id_timestamp {
            if timestamp.elapsed() < self.config.connect_timeout {
                return state.mqtt_id.clone();
            }
        }
        // Too long since a successful send, not trusting the modem
        if state.last_success.elapsed() > self.config.keepalive() {
            warn!("Too long since a successful send, force a reconnect");
            state.mqtt_id = MqttId::Disconnected("Expired MQTT connection".to_owned());
            return state.mqtt_id.clone();
        }
        if let MqttId::Disconnected(_) = state.mqtt_id {
            let pattern = format!(
                "CMQCON: ([0-9]),1,\"{}\"",
                regex::escape(&self.config.broker_url)
            );
            let response =
                self.at.call_match("AT+CMQCON?", &pattern, &[], DEFAULT_TIMEOUT).await;
            if let Some(query) = response.query {
                if let Ok(id) = query[0].parse::<u8>() {
                    state.mqtt_id = MqttId::Connected(id);
                    state.id_timestamp = Some(Instant::now());
                }
            }
        }
        state.mqtt_id.clone()
    }

    /// Establishes a broker session if there is none.
    pub async fn mqtt_connect(&self) {
        let mut state = self.state.lock().await;
        if let MqttId::Disconnected(_) = self.detect_mqtt_id(&mut state).await {
            self.mqtt_connect_internal(&mut state).await;
            if let MqttId::Disconnected(reason) = &state.mqtt_id {
                error!("MQTT connection failed: {reason}");
            }
        }
    }

    async fn mqtt_connect_internal(&self, state: &mut SessionState) {
        self.at.call("ATE0", DEFAULT_TIMEOUT).await;
        if let MqttId::Connected(_) = state.mqtt_id {
            return;
        }

        let response = self
            .at
            .call_match("AT+CEREG?", "CEREG: [0123],([15])", &[], DEFAULT_TIMEOUT)
            .await;
        let location_reporting =
            response.full_response.iter().any(|line| line.starts_with("+CEREG: 3"));
        if !location_reporting {
            // Registration URCs with location info
            self.at.call("AT+CEREG=3", DEFAULT_TIMEOUT).await;
        }
        if response.query.is_none() {
            state.mqtt_id = MqttId::Disconnected("Not registered yet".to_owned());
            return;
        }

        let response = self.at.call_match("AT+CCLK?", "CCLK: (.*)", &[], DEFAULT_TIMEOUT).await;
        if let Some(query) = &response.query {
            self.sync_clock(&query[0]).await;
        }

        // A leftover session means CMQNEW is fine but CMQCON is not; the
        // only remedy is a disconnect.
        let response = self
            .at
            .call_match("AT+CMQNEW?", r"\+CMQNEW: ([0-9]),1", &[], DEFAULT_TIMEOUT)
            .await;
        if let Some(query) = &response.query {
            if let Ok(stale_id) = query[0].parse::<u8>() {
                self.mqtt_disconnect(stale_id).await;
            }
        }

        let command = format!(
            "AT+CMQNEW=\"{}\",\"{}\",{}000,400",
            self.config.broker_url,
            self.config.broker_port,
            self.config.connect_timeout.as_secs(),
        );
        let response = self.at.call_match(&command, "CMQNEW: ([0-9])", &[], CMQNEW_TIMEOUT).await;
        let Some(query) = response.query else {
            self.ping().await;
            state.mqtt_id =
                MqttId::Disconnected("Connection AT command unsuccessful".to_owned());
            return;
        };
        let Ok(mqtt_id) = query[0].parse::<u8>() else {
            state.mqtt_id = MqttId::Disconnected(format!("Bad session id: {}", query[0]));
            return;
        };

        let will_hex = hex::encode(&self.will);
        let command = format!(
            "AT+CMQCON={},3,\"{}\",{},0,1,\"topic={},qos=1,retained=0,message_len={},message={}\"",
            mqtt_id,
            self.config.client_name,
            self.config.keepalive().as_secs(),
            self.config.will_topic,
            will_hex.len(),
            will_hex,
        );
        let response = self.at.call(&command, self.config.keepalive()).await;
        if response.success {
            info!("Connected to mqtt_id={mqtt_id}");
            state.mqtt_id = MqttId::Connected(mqtt_id);
            state.id_timestamp = Some(Instant::now());
        } else {
            self.ping().await;
            state.mqtt_id = MqttId::Disconnected("Connection unsuccessful".to_owned());
        }
    }

    async fn sync_clock(&self, modem_clock: &str) {
        match parse_modem_clock(modem_clock) {
            Some(modem_time) => {
                if let Some(correction) = clock_correction(modem_time, Utc::now()) {
                    self.clock.set(correction).await;
                }
            }
            None => error!("Failed to parse modem clock: {modem_clock}"),
        }
    }

    async fn ping(&self) {
        self.at
            .call_match("AT+CIPPING=8.8.8.8,1,32,130", "OK", &[], Duration::from_secs(15))
            .await;
    }

    async fn restart(&self, state: &mut SessionState) {
        self.at.call("AT+CFUN=0", CFUN_TIMEOUT).await;
        self.at.call("AT+CFUN=1", CFUN_TIMEOUT).await;
        // Pretend success so restarts stay RESTART_TIME apart
        state.last_success = Instant::now();
    }

    /// Publishes `message` on `topic`. Reconnects first if the session is
    /// down; a failed publish does not itself tear the session down, the
    /// `+CMQDISCON` URC does.
    pub async fn mqtt_send(&self, topic: &str, message: &[u8], qos: u8) -> crate::Result<()> {
        self.mqtt_connect().await;

        let mut state = self.state.lock().await;
        let mqtt_id = match &state.mqtt_id {
            MqttId::Disconnected(reason) => {
                let reason = reason.clone();
                if state.last_success.elapsed() > RESTART_TIME {
                    info!("Too long since the last successful MQTT send, restarting modem");
                    self.restart(&mut state).await;
                }
                return Err(Error::Modem(reason));
            }
            MqttId::Connected(id) => *id,
        };

        let message_hex = hex::encode(message);
        let command = format!(
            "AT+CMQPUB={mqtt_id},\"{topic}\",{qos},0,0,{},\"{message_hex}\"",
            message_hex.len(),
        );
        let timeout = self.config.connect_timeout + Duration::from_secs(3);
        let response = self.at.call(&command, timeout).await;
        if response.success {
            state.last_success = Instant::now();
            state.id_timestamp = Some(Instant::now());
            Ok(())
        } else {
            Err(Error::Modem("MQTT send unsuccessful".to_owned()))
        }
    }

    /// Current cell signal readings from `AT+CENG?`.
    pub async fn signal_info(&self) -> Option<CellSignalInfo> {
        self.at.call("AT*MGCOUNT=1,1", DEFAULT_TIMEOUT).await;
        let response = self.at.call_match("AT+CENG?", "CENG: (.*)", &[6, 3], DEFAULT_TIMEOUT).await;
        if self.at.last_response_age().await > Duration::from_secs(300) {
            self.power_on().await;
        }

        let query = response.query?;
        let dbm: i32 = query.first()?.parse().ok()?;
        let cellid_raw = query.get(1)?;
        let cellid = match u64::from_str_radix(
            cellid_raw.trim_matches('"').trim_start_matches("0x"),
            16,
        ) {
            Ok(cellid) => cellid,
            Err(_) => {
                error!("Failed to parse cell ID {cellid_raw}");
                return None;
            }
        };
        Some(CellSignalInfo {
            network_type: CellNetworkType::NbIotEcl0,
            dbm,
            cellid,
        })
    }

    pub async fn mqtt_id(&self) -> MqttId {
        self.state.lock().await.mqtt_id.clone()
    }
}

/// Parses the `AT+CCLK?` timestamp `yy/mm/dd,HH:MM:SS±zz` as UTC.
pub fn parse_modem_clock(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().trim_matches('"');
    let naive = NaiveDateTime::parse_from_str(raw.get(..17)?, "%y/%m/%d,%H:%M:%S").ok()?;
    Some(naive.and_utc())
}

/// The modem time, when it leads `now` by more than 5 s. The host clock
/// only ever jumps forward; small offsets are left alone.
pub fn clock_correction(modem_time: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (modem_time - now > chrono::Duration::seconds(5)).then_some(modem_time)
}

#[cfg(test)]
mod test_clock {
    use super::*;

    #[test]
    fn test_clock_correction() {
        let modem_clock = "\"23/06/09,12:06:31+08\"";
        let modem_time = parse_modem_clock(modem_clock).unwrap();
        assert_eq!(
            modem_time,
            Utc.with_ymd_and_hms(2023, 6, 9, 12, 6, 31).unwrap()
        );

        let now = Utc.with_ymd_and_hms(2023, 6, 9, 12, 6, 25).unwrap();
        assert_eq!(clock_correction(modem_time, now), Some(modem_time));

        let now = Utc.with_ymd_and_hms(2023, 6, 9, 12, 6, 27).unwrap();
        assert_eq!(clock_correction(modem_time, now), None);
    }

    #[test]
    fn test_bad_modem_clock() {
        assert!(parse_modem_clock("garbage").is_none());
    }
}

#[cfg(test)]
mod test_session {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct RecordingClock {
        sets: Arc<StdMutex<Vec<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl ClockSync for RecordingClock {
        async fn set(&self, time: DateTime<Utc>) {
            self.sets.lock().unwrap().push(time);
        }
    }

    fn test_config() -> Sim7020Config {
        Sim7020Config {
            client_name: "SIM7020-test".to_owned(),
            will_topic: "yar/abcdef012345/status".to_owned(),
            broker_url: "broker.hivemq.com".to_owned(),
            broker_port: 1883,
            apn: "internet.iot".to_owned(),
            connect_timeout: Duration::from_secs(45),
        }
    }

    /// Serves a scripted transcript: for each entry, expects one command
    /// with the given prefix and replies with the given lines.
    async fn fake_modem(
        server: tokio::io::DuplexStream,
        script: Vec<(&'static str, String)>,
    ) {
        let (read_half, mut write_half) = tokio::io::split(server);
        let mut reader = BufReader::new(read_half);
        for (expected, reply) in script {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(
                line.trim_end().starts_with(expected),
                "expected {expected}, got {line}"
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_connect_clock_sync_and_disconnect_recovery() {
        let ok = "OK\r\n".to_owned();
        let modem_clock = (Utc::now() + chrono::Duration::seconds(10))
            .format("+CCLK: \"%y/%m/%d,%H:%M:%S+32\"\r\nOK\r\n")
            .to_string();
        let script = vec![
            // setup
            ("ATE0", ok.clone()),
            ("AT", ok.clone()),
            ("ATE0", ok.clone()),
            ("AT+CMEE=2", ok.clone()),
            ("AT+CREVHEX=1", ok.clone()),
            ("AT+CMQTSYNC=1", ok.clone()),
            ("AT+CLTS=1", ok.clone()),
            ("AT*MCGDEFCONT=\"IP\",\"internet.iot\"", ok.clone()),
            // mqtt_connect: not registered recently, probe and connect
            ("AT+CMQCON?", ok.clone()),
            ("ATE0", ok.clone()),
            ("AT+CEREG?", "+CEREG: 0,5\r\nOK\r\n".to_owned()),
            ("AT+CEREG=3", ok.clone()),
            ("AT+CCLK?", modem_clock),
            ("AT+CMQNEW?", ok.clone()),
            ("AT+CMQNEW=\"broker.hivemq.com\"", "+CMQNEW: 0\r\nOK\r\n".to_owned()),
            ("AT+CMQCON=0,3,\"SIM7020-test\"", ok.clone()),
            // publish fails and the modem reports a disconnect
            ("AT+CMQPUB=0", "+CMQDISCON: 0\r\nERROR\r\n".to_owned()),
            // next send reconnects exactly once
            ("AT+CMQCON?", ok.clone()),
            ("ATE0", ok.clone()),
            ("AT+CEREG?", "+CEREG: 0,5\r\nOK\r\n".to_owned()),
            ("AT+CEREG=3", ok.clone()),
            ("AT+CCLK?", ok.clone()),
            ("AT+CMQNEW?", ok.clone()),
            ("AT+CMQNEW=\"broker.hivemq.com\"", "+CMQNEW: 0\r\nOK\r\n".to_owned()),
            ("AT+CMQCON=0,3,\"SIM7020-test\"", ok.clone()),
            ("AT+CMQPUB=0", ok.clone()),
        ];

        let (client, server) = tokio::io::duplex(4096);
        let modem = tokio::spawn(fake_modem(server, script));

        let sets = Arc::new(StdMutex::new(Vec::new()));
        let clock = RecordingClock { sets: sets.clone() };
        let sim7020 = Sim7020::start(AtEngine::new(client), test_config(), Box::new(clock));

        sim7020.setup().await;
        sim7020.mqtt_connect().await;
        assert_eq!(sim7020.mqtt_id().await, MqttId::Connected(0));
        assert_eq!(sets.lock().unwrap().len(), 1);

        // The failing publish surfaces as an error and the DISCON URC
        // marks the session down.
        let res = sim7020.mqtt_send("yar/abcdef012345/p", b"\x0a\x02\x12\x34", 1).await;
        assert!(res.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            sim7020.mqtt_id().await,
            MqttId::Disconnected("Disconnected".to_owned())
        );

        // One reconnect, then the publish goes through.
        let res = sim7020.mqtt_send("yar/abcdef012345/p", b"\x0a\x02\x12\x34", 1).await;
        assert!(res.is_ok());
        assert_eq!(sim7020.mqtt_id().await, MqttId::Connected(0));
        // No further clock set: the second CCLK? read had nothing to match
        assert_eq!(sets.lock().unwrap().len(), 1);

        modem.await.unwrap();
    }
}
