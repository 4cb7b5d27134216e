//! punchgate-forwarder: the central role.
//!
//! Subscribes to the cloud broker, routes every configured node's topics
//! through the message handler, keeps per-node status for the operator
//! table and re-emits punches into the final scoring systems.

mod config;
mod message_handler;
mod meshtastic;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::prelude::*;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{error, info};

use punchgate_common::system_info::{self, MacAddress};

use config::Config;
use message_handler::MessageHandler;

const TABLE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "punchgate-forwarder",
    about = "SportIdent punch forwarder, central role"
)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "mqtt-forwarder.toml")]
    config: String,
}

/// Logs the operator status table once a minute. The tracker lock is held
/// only for the snapshot.
async fn draw_table(tracker: Arc<std::sync::Mutex<state::StatusTracker>>) {
    tokio::time::sleep(Duration::from_secs(20)).await;
    let mut interval = tokio::time::interval(TABLE_PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = Local::now().fixed_offset();
        let table = tracker.lock().unwrap().info_table(now);
        for [name, signal, codes, last_update, last_punch] in table {
            info!("{name:12} {signal:18} {codes:15} {last_update:>9} {last_punch:>9}");
        }
    }
}

async fn subscribe_all(
    client: &AsyncClient,
    online_macs: &[MacAddress],
    radio_macs: &[MacAddress],
    channel: &str,
) {
    for mac in online_macs {
        if let Err(err) = client.subscribe(format!("yar/{mac}/#"), QoS::AtLeastOnce).await {
            error!("Subscribe failed: {err}");
        }
    }
    for mac in radio_macs {
        for topic in [
            format!("yar/2/c/serial/!{mac}"),
            format!("yar/2/c/{channel}/!{mac}"),
        ] {
            if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce).await {
                error!("Subscribe failed: {err}");
            }
        }
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

    let dns = config.dns()?;
    let mut online_macs = Vec::new();
    let mut radio_macs = Vec::new();
    for mac in dns.keys() {
        match mac {
            MacAddress::Full(_) => online_macs.push(*mac),
            MacAddress::Meshtastic(_) => radio_macs.push(*mac),
        }
    }

    let hostname = system_info::hostname();
    let forwarder_mac: MacAddress = system_info::eth_mac_addr()
        .and_then(|mac| mac.parse().ok())
        .unwrap_or_default();
    let client_group = Arc::new(config::create_clients(
        &config.client,
        forwarder_mac,
        &hostname,
    )?);
    if client_group.is_empty() {
        info!("Listening without forwarding");
    }
    let _client_loops = client_group.spawn_loops();

    let gateway_mac = config
        .meshtastic
        .gateway_mac
        .as_ref()
        .map(|mac| mac.parse::<MacAddress>())
        .transpose()
        .context("Invalid meshtastic.gateway_mac")?;
    let mut handler = MessageHandler::new(
        dns,
        client_group,
        config.meshtastic.main_channel.clone(),
        gateway_mac,
    );
    tokio::spawn(draw_table(handler.tracker()));

    let mut options = MqttOptions::new(
        format!("pgate-fwd-{hostname}"),
        &config.broker_url,
        config.broker_port,
    );
    options.set_keep_alive(Duration::from_secs(15));
    let (client, mut event_loop) = AsyncClient::new(options, 128);

    let ingest = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to mqtt://{}", config.broker_url);
                    subscribe_all(
                        &client,
                        &online_macs,
                        &radio_macs,
                        &config.meshtastic.main_channel,
                    )
                    .await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handler.handle_message(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    error!("Connection lost to mqtt://{}: {err}", config.broker_url);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    };

    tokio::select! {
        _ = ingest => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, exiting");
        }
    }
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
