//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "End-to-end exercise of the peer status exchange."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! Drives a real client link against a real peer server over loopback
//! gRPC and checks that status flows one way and heartbeats the other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use ha_common::config::{PeerLinkConfig, Role};
use ha_core::LinkControl;
use ha_net::{
    LinkSettings, PeerDialer, PeerRegistry, PeerServerBuilder, PeerServerHandle, ResilientLink,
};
use ha_schemas::v1::StatusResponse;
use ha_schemas::{PeerClaim, StatusPayload};

fn fast_settings() -> LinkSettings {
    LinkSettings {
        reconnect_delay: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
    }
}

fn peer_config(address: String) -> PeerLinkConfig {
    PeerLinkConfig {
        address,
        ..PeerLinkConfig::default()
    }
}

/// Stopping the server must terminate even while peer streams are live;
/// a hang here would stall every shutdown of the daemon.
async fn stop_within_deadline(server: PeerServerHandle) {
    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("server drains within the deadline");
}

async fn wait_connected(link: &Arc<dyn LinkControl>) {
    timeout(Duration::from_secs(5), async {
        while !link.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("link connects within the deadline");
}

#[tokio::test]
async fn status_reaches_the_registry_and_heartbeats_flow_back() {
    let (events_tx, mut events_rx) = mpsc::channel(16);
    let registry = PeerRegistry::new(events_tx, Duration::from_millis(100));
    let server = PeerServerBuilder::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&registry))
        .spawn()
        .await
        .unwrap();

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<StatusResponse>(16);
    let config = peer_config(format!("http://{}", server.address()));
    let link = ResilientLink::new("peer", PeerDialer::new(&config), fast_settings(), inbound_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintain = Arc::clone(&link).spawn(shutdown_rx.clone());

    let control: Arc<dyn LinkControl> = Arc::clone(&link) as Arc<dyn LinkControl>;
    wait_connected(&control).await;

    // Client -> server: an arbitration claim lands in the events channel.
    let claim = PeerClaim {
        name: "ha-b".into(),
        role: Role::Master,
        term: 1,
        priority: 20,
    };
    link.send(StatusPayload::Arbiter(claim.clone()).into())
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .expect("event within the deadline")
        .expect("events channel open");
    assert_eq!(received, StatusPayload::Arbiter(claim));

    // Server -> client: the per-session heartbeat sender ticks.
    let hb = timeout(Duration::from_secs(5), inbound_rx.recv())
        .await
        .expect("heartbeat within the deadline")
        .expect("inbound channel open");
    assert!(matches!(
        StatusPayload::try_from(hb).unwrap(),
        StatusPayload::Heartbeat(_)
    ));
    assert_eq!(registry.len(), 1);

    let _ = shutdown_tx.send(true);
    let _ = maintain.await;
    stop_within_deadline(server).await;
}

#[tokio::test]
async fn link_redials_until_the_server_appears() {
    // Reserve a port, then release it so the first dials fail.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let (inbound_tx, _inbound_rx) = mpsc::channel::<StatusResponse>(16);
    let config = peer_config(format!("http://{addr}"));
    let link = ResilientLink::new("peer", PeerDialer::new(&config), fast_settings(), inbound_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintain = Arc::clone(&link).spawn(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!link.is_connected());

    let (events_tx, _events_rx) = mpsc::channel(16);
    let registry = PeerRegistry::new(events_tx, Duration::from_secs(1));
    let server = PeerServerBuilder::new(addr, registry).spawn().await.unwrap();

    let control: Arc<dyn LinkControl> = Arc::clone(&link) as Arc<dyn LinkControl>;
    wait_connected(&control).await;

    let _ = shutdown_tx.send(true);
    let _ = maintain.await;
    stop_within_deadline(server).await;
}

#[tokio::test]
async fn dropping_the_client_stream_empties_the_registry() {
    let (events_tx, _events_rx) = mpsc::channel(16);
    let registry = PeerRegistry::new(events_tx, Duration::from_millis(100));
    let server = PeerServerBuilder::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&registry))
        .spawn()
        .await
        .unwrap();

    let (inbound_tx, _inbound_rx) = mpsc::channel::<StatusResponse>(16);
    let config = peer_config(format!("http://{}", server.address()));
    let link = ResilientLink::new("peer", PeerDialer::new(&config), fast_settings(), inbound_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintain = Arc::clone(&link).spawn(shutdown_rx);

    let control: Arc<dyn LinkControl> = Arc::clone(&link) as Arc<dyn LinkControl>;
    wait_connected(&control).await;
    timeout(Duration::from_secs(5), async {
        while registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session registers within the deadline");

    // Tear the client down; the server-side receive loop must deregister.
    let _ = shutdown_tx.send(true);
    link.set_connected(false);
    let _ = maintain.await;
    drop(link);

    timeout(Duration::from_secs(5), async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session deregisters within the deadline");

    stop_within_deadline(server).await;
}
