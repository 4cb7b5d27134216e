//! punchgate-node: the field-node role.
//!
//! Reads SI punches from attached USB readers (or a fake source), stamps
//! them with the node identity and fans them out to every enabled sink.
//! Alongside the punch path: a MiniCallHome heartbeat every 20 seconds
//! and device attach/detach statuses.

mod config;
mod si_manager;
mod usb;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::prelude::*;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use punchgate_common::clients::ClientGroup;
use punchgate_common::proto::{status, DevEvent, EventType, Status};
use punchgate_common::punch::SiPunchLog;
use punchgate_common::system_info::{self, HostInfo, MacAddress};

use config::Config;
use si_manager::{CodesSnapshot, PunchQueue};
use usb::DeviceEvent;

const MCH_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Parser, Debug)]
#[command(name = "punchgate-node", about = "SportIdent punch forwarder, field-node role")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "send-punch.toml")]
    config: String,
}

async fn periodic_mini_call_home(
    client_group: Arc<ClientGroup>,
    codes: CodesSnapshot,
    mac_addr: MacAddress,
) {
    // Give the clients a moment to connect
    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut interval = tokio::time::interval(MCH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut mini_call_home = system_info::create_mini_call_home(Utc::now());
        mini_call_home.codes = codes.to_codes_string();
        let status = Status {
            msg: Some(status::Msg::MiniCallHome(mini_call_home)),
        };
        client_group.send_status(&status, &mac_addr).await;
    }
}

async fn forward_punches(
    queue: Arc<PunchQueue>,
    client_group: Arc<ClientGroup>,
    host_info: HostInfo,
) {
    loop {
        let punch = queue.pop().await;
        let now = Local::now().fixed_offset();
        let punch_log = SiPunchLog::new(punch, host_info.clone(), &now);
        info!("{punch_log}");
        let results = client_group.send_punch(&punch_log).await;
        if !results.is_empty() && results.iter().all(|sent| !sent) {
            error!("Punch of card {} reached no sink", punch_log.punch.card);
        }
    }
}

async fn forward_device_events(
    mut dev_events: mpsc::Receiver<DeviceEvent>,
    client_group: Arc<ClientGroup>,
    mac_addr: MacAddress,
) {
    while let Some(event) = dev_events.recv().await {
        let port = event.tty_path.trim_start_matches("/dev/").to_lowercase();
        let r#type = if event.added {
            EventType::Added
        } else {
            EventType::Removed
        };
        let status = Status {
            msg: Some(status::Msg::DevEvent(DevEvent {
                r#type: r#type as i32,
                port,
            })),
        };
        client_group.send_status(&status, &mac_addr).await;
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    let mac_addr: MacAddress = config
        .mac_addr
        .clone()
        .or_else(system_info::eth_mac_addr)
        .context("No MAC address configured and none found on an ethernet interface")?
        .parse()?;
    let hostname = config.hostname.clone().unwrap_or_else(system_info::hostname);
    info!("Starting PunchSender for {hostname}/{mac_addr}");

    let client_group = Arc::new(config::create_clients(&config.client, mac_addr, &hostname)?);
    if client_group.is_empty() {
        warn!("No clients enabled, will listen to punches but nothing will be sent");
    }
    let _client_loops = client_group.spawn_loops();

    let queue = Arc::new(PunchQueue::new(64));
    let codes = CodesSnapshot::default();
    let (dev_event_tx, dev_event_rx) = mpsc::channel(16);

    match config.punch_source_kind()? {
        "fake" => {
            tokio::spawn(si_manager::fake_punches(queue.clone(), mac_addr));
        }
        _ => {
            let (device_tx, device_rx) = mpsc::channel(16);
            tokio::spawn(usb::watch_devices(device_tx));
            tokio::spawn(si_manager::run(
                device_rx,
                dev_event_tx,
                queue.clone(),
                codes.clone(),
                mac_addr,
            ));
        }
    }

    tokio::spawn(periodic_mini_call_home(client_group.clone(), codes, mac_addr));
    tokio::spawn(forward_device_events(dev_event_rx, client_group.clone(), mac_addr));
    tokio::spawn(forward_punches(
        queue,
        client_group,
        HostInfo::new(&hostname, mac_addr),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, exiting");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
