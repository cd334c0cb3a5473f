//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Peer session registry and the status exchange server."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! Server side of the HA pair: accepts the peer's duplex stream, tracks
//! each live stream as a session in the [`PeerRegistry`], feeds each
//! session a periodic heartbeat, and forwards decoded peer status to the
//! arbiter. Session removal is keyed on `HashMap::remove`, so the
//! receive loop and the heartbeat sender can both detect death without
//! double-running the teardown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use ha_schemas::v1::ha_sync_service_server::{HaSyncService, HaSyncServiceServer};
use ha_schemas::v1::{StatusRequest, StatusResponse};
use ha_schemas::StatusPayload;

use crate::NetError;

const SESSION_OUTBOUND_CAPACITY: usize = 64;

/// One live inbound peer stream.
pub struct PeerSession {
    id: u64,
    label: String,
    outbound: mpsc::Sender<Result<StatusResponse, Status>>,
    last_hb: Mutex<std::time::Instant>,
    /// Cancellation scope of the session's tasks. Closed exactly once,
    /// by whichever task removes the session from the registry.
    cancel: watch::Sender<bool>,
}

impl PeerSession {
    /// Registry-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable label: registration timestamp plus id.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// When this session last received a heartbeat.
    pub fn last_heartbeat(&self) -> std::time::Instant {
        *self.last_hb.lock()
    }
}

/// Registry of live peer sessions. In the two-node deployment at most
/// one session is expected; the registry still handles overlap during a
/// peer restart, where the old stream lingers until its keepalive fails.
pub struct PeerRegistry {
    sessions: RwLock<HashMap<u64, Arc<PeerSession>>>,
    next_id: AtomicU64,
    events: mpsc::Sender<StatusPayload>,
    heartbeat_interval: Duration,
}

impl PeerRegistry {
    /// Registry forwarding decoded peer payloads to `events`.
    pub fn new(events: mpsc::Sender<StatusPayload>, heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events,
            heartbeat_interval,
        })
    }

    /// Register a fresh session around the given response sender.
    pub fn register(
        &self,
        outbound: mpsc::Sender<Result<StatusResponse, Status>>,
    ) -> Arc<PeerSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let label = format!("{}-{id:04}", Utc::now().format("%Y%m%d%H%M%S%.6f"));
        let (cancel, _) = watch::channel(false);
        let session = Arc::new(PeerSession {
            id,
            label,
            outbound,
            last_hb: Mutex::new(std::time::Instant::now()),
            cancel,
        });
        let count = {
            let mut sessions = self.sessions.write();
            sessions.insert(id, Arc::clone(&session));
            sessions.len()
        };
        info!(session = %session.label, sessions = count, "peer session registered");
        session
    }

    /// Remove a session and cancel its tasks. Returns false if another
    /// caller already removed it; the loser does nothing.
    pub fn remove(&self, id: u64) -> bool {
        let removed = self.sessions.write().remove(&id);
        match removed {
            Some(session) => {
                let _ = session.cancel.send(true);
                info!(
                    session = %session.label,
                    sessions = self.sessions.read().len(),
                    "peer session removed"
                );
                true
            }
            None => false,
        }
    }

    /// Best-effort fan-out to every live session. A full or closed
    /// session queue drops the message for that session only; its own
    /// loops handle teardown.
    pub fn broadcast(&self, payload: StatusPayload) {
        let sessions: Vec<Arc<PeerSession>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            let msg: StatusResponse = payload.clone().into();
            if let Err(err) = session.outbound.try_send(Ok(msg)) {
                warn!(session = %session.label, error = %err, "broadcast send failed");
            }
        }
    }

    /// Cancel and remove every session. Open streams hold the server's
    /// graceful drain, so shutdown runs this before waiting for it.
    pub fn drain(&self) {
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.write().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!(sessions = sessions.len(), "cancelling peer sessions for shutdown");
        for session in sessions {
            let _ = session.cancel.send(true);
        }
    }

    /// Send to one session.
    pub async fn send_to(&self, id: u64, payload: StatusPayload) -> Result<(), NetError> {
        let session = self
            .sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(NetError::SessionNotFound(id))?;
        session
            .outbound
            .send(Ok(payload.into()))
            .await
            .map_err(|_| NetError::ChannelClosed)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// True when no peer stream is attached.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn spawn_session_heartbeat(self: &Arc<Self>, session: Arc<PeerSession>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut cancel = session.cancel.subscribe();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let msg: StatusResponse = StatusPayload::heartbeat_now().into();
                        match session.outbound.try_send(Ok(msg)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(session = %session.label, "heartbeat dropped; session queue full");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                registry.remove(session.id);
                                break;
                            }
                        }
                    }
                }
            }
            debug!(session = %session.label, "session heartbeat stopped");
        })
    }

    fn spawn_session_receive(
        self: &Arc<Self>,
        session: Arc<PeerSession>,
        mut inbound: Streaming<StatusRequest>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut cancel = session.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    next = inbound.message() => {
                        match next {
                            Ok(Some(msg)) => {
                                match StatusPayload::try_from(msg) {
                                    Ok(payload) => {
                                        if let StatusPayload::Heartbeat(_) = payload {
                                            *session.last_hb.lock() = std::time::Instant::now();
                                        }
                                        // Forwarded either way: any peer
                                        // payload counts as liveness for
                                        // the arbiter.
                                        if registry.events.send(payload).await.is_err() {
                                            warn!(session = %session.label, "status consumer gone");
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        warn!(
                                            session = %session.label,
                                            error = %err,
                                            "dropping undecodable peer message"
                                        );
                                    }
                                }
                            }
                            Ok(None) => {
                                info!(session = %session.label, "peer closed the stream");
                                break;
                            }
                            Err(status) => {
                                warn!(session = %session.label, error = %status, "peer stream error");
                                break;
                            }
                        }
                    }
                }
            }
            registry.remove(session.id);
        })
    }
}

/// gRPC service accepting the peer's status exchange stream.
pub struct HaSyncServer {
    registry: Arc<PeerRegistry>,
}

impl HaSyncServer {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl HaSyncService for HaSyncServer {
    type ExchangeStatusStream = ReceiverStream<Result<StatusResponse, Status>>;

    async fn exchange_status(
        &self,
        request: Request<Streaming<StatusRequest>>,
    ) -> Result<Response<Self::ExchangeStatusStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(SESSION_OUTBOUND_CAPACITY);
        let session = self.registry.register(tx);
        let _ = self.registry.spawn_session_heartbeat(Arc::clone(&session));
        let _ = self.registry.spawn_session_receive(session, inbound);
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Builder for the peer-facing gRPC listener.
pub struct PeerServerBuilder {
    listen: SocketAddr,
    registry: Arc<PeerRegistry>,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
}

impl PeerServerBuilder {
    pub fn new(listen: SocketAddr, registry: Arc<PeerRegistry>) -> Self {
        Self {
            listen,
            registry,
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
        }
    }

    /// HTTP/2 keepalive ping cadence towards connected peers.
    pub fn keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    /// Bind the listener and run the server until the handle signals
    /// shutdown.
    pub async fn spawn(self) -> Result<PeerServerHandle> {
        let listener = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("binding peer listener on {}", self.listen))?;
        let address = listener.local_addr()?;
        let incoming = TcpIncoming::from_listener(listener, true, None)
            .map_err(|err| anyhow!("peer listener setup failed: {err}"))?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let service = HaSyncServiceServer::new(HaSyncServer::new(self.registry));
        let keepalive_interval = self.keepalive_interval;
        let keepalive_timeout = self.keepalive_timeout;

        info!(address = %address, "peer sync server listening");
        let task = tokio::spawn(async move {
            let result = Server::builder()
                .http2_keepalive_interval(Some(keepalive_interval))
                .http2_keepalive_timeout(Some(keepalive_timeout))
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = shutdown_rx.changed().await;
                    // Ending the session tasks closes their response
                    // streams; only then can the drain finish.
                    registry.drain();
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "peer sync server exited with error");
            } else {
                debug!("peer sync server stopped");
            }
        });

        Ok(PeerServerHandle {
            address,
            shutdown,
            task,
        })
    }
}

/// Running peer server, shut down by dropping or signalling the handle.
pub struct PeerServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerServerHandle {
    /// Actual bound address, useful with port 0.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Request shutdown and wait for the listener to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<PeerRegistry>, mpsc::Receiver<StatusPayload>) {
        let (tx, rx) = mpsc::channel(16);
        (PeerRegistry::new(tx, Duration::from_millis(100)), rx)
    }

    #[tokio::test]
    async fn removal_is_exactly_once() {
        let (registry, _events) = registry();
        let (tx, _rx) = mpsc::channel(4);
        let session = registry.register(tx);
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(session.id()));
        assert!(!registry.remove(session.id()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_removal_has_a_single_winner() {
        let (registry, _events) = registry();
        let (tx, _rx) = mpsc::channel(4);
        let id = registry.register(tx).id();

        let a = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.remove(id) })
        };
        let b = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.remove(id) })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b, "exactly one task must win the removal");
    }

    #[tokio::test]
    async fn removal_cancels_the_session_scope() {
        let (registry, _events) = registry();
        let (tx, _rx) = mpsc::channel(4);
        let session = registry.register(tx);
        let mut cancel = session.cancel.subscribe();

        assert!(registry.remove(session.id()));
        cancel.changed().await.expect("cancel signalled");
        assert!(*cancel.borrow());
    }

    #[tokio::test]
    async fn drain_cancels_every_session() {
        let (registry, _events) = registry();
        let (a_tx, _a) = mpsc::channel(4);
        let (b_tx, _b) = mpsc::channel(4);
        let a = registry.register(a_tx);
        let b = registry.register(b_tx);
        let mut cancel_a = a.cancel.subscribe();
        let mut cancel_b = b.cancel.subscribe();

        registry.drain();

        assert!(registry.is_empty());
        cancel_a.changed().await.expect("session a cancelled");
        cancel_b.changed().await.expect("session b cancelled");
        assert!(*cancel_a.borrow());
        assert!(*cancel_b.borrow());
        // A second drain has nothing left to do.
        registry.drain();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn broadcast_survives_a_dead_session() {
        let (registry, _events) = registry();
        let (dead_tx, dead_rx) = mpsc::channel(4);
        let (live_tx, mut live_rx) = mpsc::channel(4);
        registry.register(dead_tx);
        registry.register(live_tx);
        drop(dead_rx);

        registry.broadcast(StatusPayload::EcsConnected(true));

        let got = live_rx.recv().await.expect("live session receives").unwrap();
        assert_eq!(
            StatusPayload::try_from(got).unwrap(),
            StatusPayload::EcsConnected(true)
        );
    }

    #[tokio::test]
    async fn send_to_unknown_session_reports_not_found() {
        let (registry, _events) = registry();
        let err = registry
            .send_to(42, StatusPayload::heartbeat_now())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::SessionNotFound(42)));
    }

    #[test]
    fn session_labels_are_unique_per_registration() {
        let (tx, _rx) = mpsc::channel(16);
        let registry = PeerRegistry::new(tx, Duration::from_secs(1));
        let (a_tx, _a) = mpsc::channel(4);
        let (b_tx, _b) = mpsc::channel(4);
        let a = registry.register(a_tx);
        let b = registry.register(b_tx);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.label(), b.label());
    }
}
