//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "binary"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Binary entrypoint for the fleet-ha arbiter daemon."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ha_common::config::AppConfig;
use ha_common::init_tracing;
use ha_core::{Arbiter, ArbiterSettings, LinkControl, StalenessMonitor};
use ha_net::{
    FleetDialer, HealthProvider, LinkSettings, NetError, PeerDialer, PeerRegistry,
    PeerServerBuilder, ResilientLink, RestApiBuilder,
};
use ha_schemas::v1::{ServerMessage, StatusResponse};
use ha_schemas::{FleetPayload, StatusPayload};

/// Buffer between the raw stream pumps and the arbiter loop.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fleet HA arbitration daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.node-a.yaml"));
    candidates.push(PathBuf::from("/etc/fleet-ha/config.yaml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("ha-arbiterd", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        node = %config.node.name,
        initial_role = %config.node.initial_role,
        priority = config.node.priority,
        "configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Raw stream pumps feed these; decoded payloads drive the arbiter.
    let (fleet_payload_tx, fleet_payload_rx) = mpsc::channel::<FleetPayload>(CHANNEL_CAPACITY);
    let (peer_payload_tx, peer_payload_rx) = mpsc::channel::<StatusPayload>(CHANNEL_CAPACITY);

    // Fleet uplink.
    let (fleet_raw_tx, fleet_raw_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);
    let fleet_link = ResilientLink::new(
        "fleet",
        FleetDialer::new(&config.fleet),
        LinkSettings {
            reconnect_delay: config.fleet.reconnect_delay,
            heartbeat_interval: config.fleet.heartbeat_interval,
        },
        fleet_raw_tx,
    );
    tasks.push(Arc::clone(&fleet_link).spawn(shutdown_rx.clone()));
    tasks.push(Arc::clone(&fleet_link).spawn_heartbeat(shutdown_rx.clone()));
    tasks.push(spawn_fleet_decoder(fleet_raw_rx, fleet_payload_tx));

    // Peer client link towards the redundant instance.
    let (peer_raw_tx, peer_raw_rx) = mpsc::channel::<StatusResponse>(CHANNEL_CAPACITY);
    let peer_link = ResilientLink::new(
        "peer",
        PeerDialer::new(&config.peer),
        LinkSettings {
            reconnect_delay: config.peer.reconnect_delay,
            heartbeat_interval: config.peer.heartbeat_interval,
        },
        peer_raw_tx,
    );
    tasks.push(Arc::clone(&peer_link).spawn(shutdown_rx.clone()));
    tasks.push(Arc::clone(&peer_link).spawn_heartbeat(shutdown_rx.clone()));
    tasks.push(spawn_peer_decoder(peer_raw_rx, peer_payload_tx.clone()));

    // Peer server: the other instance's client link lands here. Decoded
    // payloads join the same arbiter channel as the client-side stream.
    let registry = PeerRegistry::new(peer_payload_tx, config.peer.heartbeat_interval);
    let peer_server = PeerServerBuilder::new(config.peer.listen, Arc::clone(&registry))
        .keepalive(config.peer.keepalive_interval, config.peer.keepalive_timeout)
        .spawn()
        .await?;

    // Arbitration core.
    let arbiter = Arc::new(Arbiter::new(ArbiterSettings::from_config(&config)));
    let fleet_control: Arc<dyn LinkControl> = fleet_link.clone();
    tasks.push(tokio::spawn(Arc::clone(&arbiter).run(
        fleet_payload_rx,
        peer_payload_rx,
        Arc::clone(&fleet_control),
        shutdown_rx.clone(),
    )));

    let monitor = StalenessMonitor::new(config.monitor.poll_interval);
    tasks.push(monitor.spawn_fleet(
        Arc::clone(&arbiter),
        Arc::clone(&fleet_control),
        shutdown_rx.clone(),
    ));
    tasks.push(monitor.spawn_peer(Arc::clone(&arbiter), shutdown_rx.clone()));

    tasks.push(spawn_broadcaster(
        Arc::clone(&arbiter),
        Arc::clone(&peer_link),
        Arc::clone(&registry),
        config.monitor.broadcast_interval,
        shutdown_rx.clone(),
    ));

    // REST health projection.
    let rest = if config.api.enabled {
        let provider: Arc<dyn HealthProvider> = Arc::clone(&arbiter) as Arc<dyn HealthProvider>;
        Some(RestApiBuilder::new(config.api.listen, provider).spawn().await?)
    } else {
        info!("rest api disabled by configuration");
        None
    };

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(rest) = rest {
        rest.stop().await;
    }
    peer_server.stop().await;
    for task in tasks {
        let _ = task.await;
    }
    info!("arbiter daemon stopped");
    Ok(())
}

/// Pump raw Fleet messages into decoded payloads. A message that fails
/// to decode is logged and dropped; the stream stays up.
fn spawn_fleet_decoder(
    mut raw: mpsc::Receiver<ServerMessage>,
    decoded: mpsc::Sender<FleetPayload>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = raw.recv().await {
            match FleetPayload::try_from(msg) {
                Ok(payload) => {
                    if decoded.send(payload).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "dropping undecodable fleet message"),
            }
        }
        debug!("fleet decoder stopped");
    })
}

/// Pump raw peer responses from the client-side stream into decoded
/// payloads.
fn spawn_peer_decoder(
    mut raw: mpsc::Receiver<StatusResponse>,
    decoded: mpsc::Sender<StatusPayload>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = raw.recv().await {
            match StatusPayload::try_from(msg) {
                Ok(payload) => {
                    if decoded.send(payload).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "dropping undecodable peer message"),
            }
        }
        debug!("peer decoder stopped");
    })
}

/// Push local status to the peer on a fixed cadence, over whichever
/// directions are currently live: the client link and every inbound
/// session. A down link is expected and skipped quietly.
fn spawn_broadcaster(
    arbiter: Arc<Arbiter>,
    peer_link: Arc<ResilientLink<PeerDialer>>,
    registry: Arc<PeerRegistry>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let conn = arbiter.self_connectivity();
                    let updates = [
                        StatusPayload::Arbiter(arbiter.claim()),
                        StatusPayload::EcsConnected(conn.ecs),
                        StatusPayload::FleetConnected(conn.fleet),
                    ];
                    for payload in &updates {
                        registry.broadcast(payload.clone());
                    }
                    for payload in updates {
                        match peer_link.send(payload.into()).await {
                            Ok(()) => {}
                            Err(NetError::NotConnected) => {
                                debug!("status broadcast skipped; peer link down");
                                break;
                            }
                            Err(err) => {
                                warn!(error = %err, "status broadcast failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("status broadcaster stopped");
    })
}
