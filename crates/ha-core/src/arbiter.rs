//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Arbitration core: election state machine and staleness monitors."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use ha_common::config::{AppConfig, Role};
use ha_schemas::{FleetPayload, PeerClaim, StatusPayload};

use crate::LinkControl;

/// Reachability triple maintained once for this node and once for the
/// peer's self-reported view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct Connectivity {
    /// Backend ECS service, observed indirectly through the Fleet link.
    pub ecs: bool,
    /// The Fleet dispatch backend itself.
    pub fleet: bool,
    /// The HA uplink. Constant `true` in the self view: a node cannot
    /// observe its own process being down.
    pub ha: bool,
}

/// Static inputs for an [`Arbiter`], extracted from configuration once at
/// startup.
#[derive(Debug, Clone)]
pub struct ArbiterSettings {
    /// Node name carried in outbound arbitration records.
    pub name: String,
    /// Role assumed at startup.
    pub initial_role: Role,
    /// Tie-break value; immutable for the node's lifetime.
    pub priority: i32,
    /// Inbound silence after which the Fleet link is judged stale.
    pub fleet_timeout: Duration,
    /// Inbound silence after which the peer is judged stale.
    pub peer_timeout: Duration,
    /// Promote a stale-peered slave to master.
    pub promote_on_peer_loss: bool,
}

impl ArbiterSettings {
    /// Extract the arbiter inputs from the loaded configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            name: config.node.name.clone(),
            initial_role: config.node.initial_role,
            priority: config.node.priority,
            fleet_timeout: config.fleet.heartbeat_timeout,
            peer_timeout: config.peer.heartbeat_timeout,
            promote_on_peer_loss: config.peer.promote_on_peer_loss,
        }
    }
}

#[derive(Debug)]
struct ArbiterInner {
    role: Role,
    term: i32,
    self_conn: Connectivity,
    other_conn: Connectivity,
    peer: Option<PeerClaim>,
    last_fleet_seen: Instant,
    last_peer_seen: Instant,
}

/// Election state machine and connectivity bookkeeping for one HA node.
///
/// Exactly one instance exists per process. All mutable state sits behind
/// a single read-write lock; no network I/O ever happens while the lock
/// is held.
pub struct Arbiter {
    name: String,
    priority: i32,
    fleet_timeout: Duration,
    peer_timeout: Duration,
    promote_on_peer_loss: bool,
    inner: RwLock<ArbiterInner>,
}

impl Arbiter {
    /// Build an arbiter from its static settings. Last-seen instants
    /// start at construction time so a freshly booted node is not
    /// immediately judged stale.
    pub fn new(settings: ArbiterSettings) -> Self {
        let now = Instant::now();
        Self {
            name: settings.name,
            priority: settings.priority,
            fleet_timeout: settings.fleet_timeout,
            peer_timeout: settings.peer_timeout,
            promote_on_peer_loss: settings.promote_on_peer_loss,
            inner: RwLock::new(ArbiterInner {
                role: settings.initial_role,
                term: 0,
                self_conn: Connectivity {
                    ecs: false,
                    fleet: false,
                    ha: true,
                },
                other_conn: Connectivity::default(),
                peer: None,
                last_fleet_seen: now,
                last_peer_seen: now,
            }),
        }
    }

    /// Node name carried in outbound arbitration records.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.inner.read().role
    }

    /// Current election term.
    pub fn term(&self) -> i32 {
        self.inner.read().term
    }

    /// Configured Fleet staleness timeout.
    pub fn fleet_timeout(&self) -> Duration {
        self.fleet_timeout
    }

    /// Configured peer staleness timeout.
    pub fn peer_timeout(&self) -> Duration {
        self.peer_timeout
    }

    /// The arbitration record this node reports about itself.
    pub fn claim(&self) -> PeerClaim {
        let inner = self.inner.read();
        PeerClaim {
            name: self.name.clone(),
            role: inner.role,
            term: inner.term,
            priority: self.priority,
        }
    }

    /// Measured connectivity of this node.
    pub fn self_connectivity(&self) -> Connectivity {
        self.inner.read().self_conn
    }

    /// The peer's last self-reported connectivity.
    pub fn other_connectivity(&self) -> Connectivity {
        self.inner.read().other_conn
    }

    /// Thread-safe read of exactly the two fields the health projection
    /// reports on.
    pub fn health(&self) -> HealthSnapshot {
        let inner = self.inner.read();
        HealthSnapshot {
            ecs: inner.self_conn.ecs,
            fleet: inner.self_conn.fleet,
        }
    }

    /// Full state snapshot for the operator status endpoint.
    pub fn status(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            name: self.name.clone(),
            role: inner.role,
            term: inner.term,
            priority: self.priority,
            self_conn: inner.self_conn,
            other_conn: inner.other_conn,
            peer: inner.peer.clone(),
        }
    }

    /// Apply one decoded message from the Fleet backend.
    pub fn handle_fleet(&self, payload: FleetPayload, fleet_link: &dyn LinkControl) {
        match payload {
            FleetPayload::Heartbeat(_) => {
                self.inner.write().last_fleet_seen = Instant::now();
            }
            FleetPayload::EcsConnected(connected) => {
                let mut inner = self.inner.write();
                inner.self_conn.ecs = connected;
                inner.last_fleet_seen = Instant::now();
                drop(inner);
                info!(connected, "ecs connectivity updated by fleet");
            }
            FleetPayload::FleetConnected(connected) => {
                // A revoked acknowledgment forces the link layer to agree
                // before any lock is taken.
                fleet_link.set_connected(connected);
                let mut inner = self.inner.write();
                inner.self_conn.fleet = connected;
                inner.last_fleet_seen = Instant::now();
                drop(inner);
                info!(connected, "fleet connectivity updated by fleet");
            }
        }
    }

    /// Apply one decoded message from the peer instance. Every payload
    /// counts as a liveness signal for the peer staleness monitor.
    pub fn handle_peer(&self, payload: StatusPayload) {
        let now = Instant::now();
        match payload {
            StatusPayload::Heartbeat(_) => {
                self.inner.write().last_peer_seen = now;
            }
            StatusPayload::HaConnected(connected) => {
                let mut inner = self.inner.write();
                inner.other_conn.ha = connected;
                inner.last_peer_seen = now;
            }
            StatusPayload::EcsConnected(connected) => {
                let mut inner = self.inner.write();
                inner.other_conn.ecs = connected;
                inner.last_peer_seen = now;
            }
            StatusPayload::FleetConnected(connected) => {
                let mut inner = self.inner.write();
                inner.other_conn.fleet = connected;
                inner.last_peer_seen = now;
            }
            StatusPayload::Arbiter(claim) => {
                {
                    let mut inner = self.inner.write();
                    inner.last_peer_seen = now;
                    inner.peer = Some(claim.clone());
                }
                self.resolve(&claim);
            }
        }
    }

    /// Adjudicate a peer arbitration claim.
    ///
    /// Rule 1: a strictly higher peer term wins unconditionally; adopt it
    /// and step down. Rule 2: two masters in the same term break the tie
    /// by priority, and an equal priority does not yield. Anything else
    /// leaves the state untouched. Applied identically on both nodes,
    /// this converges to exactly one master.
    pub fn resolve(&self, claim: &PeerClaim) {
        if claim.term < 0 {
            // Negative terms cannot be produced by this rule; a peer
            // reporting one is a logic defect, not data to accommodate.
            error!(peer = %claim.name, term = claim.term, "rejecting arbitration claim with negative term");
            return;
        }

        let mut inner = self.inner.write();
        if claim.term > inner.term {
            info!(
                peer = %claim.name,
                peer_term = claim.term,
                own_term = inner.term,
                "peer reports newer term; adopting it and stepping down"
            );
            inner.term = claim.term;
            inner.role = Role::Slave;
        } else if inner.role == Role::Master
            && claim.role == Role::Master
            && claim.term == inner.term
        {
            if claim.priority > self.priority {
                info!(
                    peer = %claim.name,
                    peer_priority = claim.priority,
                    own_priority = self.priority,
                    term = inner.term,
                    "double master in same term; yielding to higher priority peer"
                );
                inner.role = Role::Slave;
            } else {
                info!(
                    peer = %claim.name,
                    peer_priority = claim.priority,
                    own_priority = self.priority,
                    term = inner.term,
                    "double master in same term; retaining mastership"
                );
            }
        }
    }

    /// Re-evaluate Fleet staleness at `now`. The verdict requires both a
    /// fresh liveness signal and a live transport; it is written into the
    /// self connectivity snapshot and returned.
    pub fn evaluate_fleet(&self, now: Instant, transport_connected: bool) -> bool {
        let last = self.inner.read().last_fleet_seen;
        let fresh = now.saturating_duration_since(last) <= self.fleet_timeout;
        let verdict = fresh && transport_connected;
        self.inner.write().self_conn.fleet = verdict;
        verdict
    }

    /// Re-evaluate peer staleness at `now`, writing the verdict into the
    /// peer connectivity snapshot. A stale peer triggers self-promotion
    /// when the policy allows it.
    pub fn evaluate_peer(&self, now: Instant) -> bool {
        let last = self.inner.read().last_peer_seen;
        let alive = now.saturating_duration_since(last) <= self.peer_timeout;
        let mut inner = self.inner.write();
        inner.other_conn.ha = alive;
        if !alive && self.promote_on_peer_loss && inner.role == Role::Slave {
            inner.role = Role::Candidate;
            info!("peer heartbeat lost; standing as candidate");
            // Two-node deployment: with the peer gone there is nobody to
            // vote, so candidacy resolves immediately. The term stays
            // untouched; a returning peer settles any double master via
            // the priority tie-break.
            inner.role = Role::Master;
            info!(term = inner.term, "promoted to master after peer loss");
        }
        alive
    }

    /// Consume decoded messages from both links until shutdown or both
    /// channels close. Messages within one link are processed in arrival
    /// order; no cross-link ordering is assumed.
    pub async fn run(
        self: Arc<Self>,
        mut fleet_rx: mpsc::Receiver<FleetPayload>,
        mut peer_rx: mpsc::Receiver<StatusPayload>,
        fleet_link: Arc<dyn LinkControl>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                payload = fleet_rx.recv() => match payload {
                    Some(payload) => self.handle_fleet(payload, fleet_link.as_ref()),
                    None => {
                        warn!("fleet message channel closed");
                        break;
                    }
                },
                payload = peer_rx.recv() => match payload {
                    Some(payload) => self.handle_peer(payload),
                    None => {
                        warn!("peer message channel closed");
                        break;
                    }
                },
            }
        }
        debug!("arbiter event loop stopped");
    }
}

/// The two booleans the health projection reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Measured ECS reachability.
    pub ecs: bool,
    /// Measured Fleet reachability.
    pub fleet: bool,
}

impl HealthSnapshot {
    /// The projection reports "ok" only when both backends are reachable.
    pub fn is_ok(&self) -> bool {
        self.ecs && self.fleet
    }
}

/// Full arbiter state as exposed to operators.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Node name.
    pub name: String,
    /// Current role.
    pub role: Role,
    /// Current election term.
    pub term: i32,
    /// Static tie-break value.
    pub priority: i32,
    /// Measured connectivity of this node.
    #[serde(rename = "self")]
    pub self_conn: Connectivity,
    /// The peer's last self-reported connectivity.
    #[serde(rename = "other")]
    pub other_conn: Connectivity,
    /// Last received peer arbitration record, if any.
    pub peer: Option<PeerClaim>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn settings(role: Role, priority: i32) -> ArbiterSettings {
        ArbiterSettings {
            name: "ha-a".into(),
            initial_role: role,
            priority,
            fleet_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(5),
            promote_on_peer_loss: false,
        }
    }

    fn claim(role: Role, term: i32, priority: i32) -> PeerClaim {
        PeerClaim {
            name: "ha-b".into(),
            role,
            term,
            priority,
        }
    }

    #[derive(Default)]
    struct FakeLink {
        connected: AtomicBool,
    }

    impl LinkControl for FakeLink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }
    }

    #[test]
    fn higher_peer_term_forces_step_down() {
        let arbiter = Arbiter::new(settings(Role::Master, 50));
        arbiter.resolve(&claim(Role::Slave, 3, 1));
        assert_eq!(arbiter.role(), Role::Slave);
        assert_eq!(arbiter.term(), 3);
    }

    #[test]
    fn equal_term_double_master_yields_to_higher_priority() {
        let arbiter = Arbiter::new(settings(Role::Master, 10));
        arbiter.resolve(&claim(Role::Master, 0, 20));
        assert_eq!(arbiter.role(), Role::Slave);
        assert_eq!(arbiter.term(), 0);
    }

    #[test]
    fn equal_term_double_master_retains_against_lower_priority() {
        let arbiter = Arbiter::new(settings(Role::Master, 20));
        arbiter.resolve(&claim(Role::Master, 0, 10));
        assert_eq!(arbiter.role(), Role::Master);
    }

    #[test]
    fn equal_priority_does_not_yield() {
        let arbiter = Arbiter::new(settings(Role::Master, 10));
        arbiter.resolve(&claim(Role::Master, 0, 10));
        assert_eq!(arbiter.role(), Role::Master);
    }

    #[test]
    fn slave_ignores_equal_term_master_claim() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        arbiter.resolve(&claim(Role::Master, 0, 20));
        assert_eq!(arbiter.role(), Role::Slave);
        assert_eq!(arbiter.term(), 0);
    }

    #[test]
    fn term_never_decreases() {
        let arbiter = Arbiter::new(settings(Role::Master, 10));
        let mut observed = arbiter.term();
        for peer_claim in [
            claim(Role::Master, 4, 20),
            claim(Role::Master, 2, 20),
            claim(Role::Slave, 0, 20),
            claim(Role::Master, 4, 5),
            claim(Role::Master, 9, 5),
        ] {
            arbiter.resolve(&peer_claim);
            assert!(arbiter.term() >= observed);
            observed = arbiter.term();
        }
        assert_eq!(observed, 9);
    }

    #[test]
    fn negative_term_claim_is_rejected() {
        let arbiter = Arbiter::new(settings(Role::Master, 10));
        arbiter.resolve(&claim(Role::Master, -1, 99));
        assert_eq!(arbiter.role(), Role::Master);
        assert_eq!(arbiter.term(), 0);
    }

    #[test]
    fn fleet_connectivity_update_forces_link_flag() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        let link = FakeLink::default();
        link.set_connected(true);

        arbiter.handle_fleet(FleetPayload::FleetConnected(false), &link);
        assert!(!link.is_connected());
        assert!(!arbiter.self_connectivity().fleet);

        arbiter.handle_fleet(FleetPayload::FleetConnected(true), &link);
        assert!(link.is_connected());
        assert!(arbiter.self_connectivity().fleet);
    }

    #[test]
    fn ecs_update_touches_only_self_view() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        let link = FakeLink::default();
        arbiter.handle_fleet(FleetPayload::EcsConnected(true), &link);
        assert!(arbiter.self_connectivity().ecs);
        assert!(!arbiter.other_connectivity().ecs);
    }

    #[test]
    fn peer_ecs_update_lands_in_other_ecs() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        arbiter.handle_peer(StatusPayload::EcsConnected(true));
        let other = arbiter.other_connectivity();
        assert!(other.ecs);
        assert!(!other.fleet);
    }

    #[test]
    fn fleet_verdict_requires_fresh_signal_and_live_transport() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        let now = Instant::now();

        assert!(arbiter.evaluate_fleet(now, true));
        // Fresh timestamp but dead transport: verdict must be false.
        assert!(!arbiter.evaluate_fleet(now, false));
        // Live transport but stale timestamp: verdict must be false.
        let late = now + Duration::from_secs(31);
        assert!(!arbiter.evaluate_fleet(late, true));
        assert!(!arbiter.self_connectivity().fleet);
    }

    #[test]
    fn peer_staleness_flips_and_recovers() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        let now = Instant::now();

        assert!(arbiter.evaluate_peer(now));
        assert!(arbiter.other_connectivity().ha);

        let late = now + Duration::from_secs(6);
        assert!(!arbiter.evaluate_peer(late));
        assert!(!arbiter.other_connectivity().ha);

        arbiter.handle_peer(StatusPayload::heartbeat_now());
        assert!(arbiter.evaluate_peer(Instant::now()));
        assert!(arbiter.other_connectivity().ha);
    }

    #[test]
    fn stale_peer_promotes_slave_only_under_policy() {
        let mut enabled = settings(Role::Slave, 10);
        enabled.promote_on_peer_loss = true;
        let arbiter = Arbiter::new(enabled);
        let late = Instant::now() + Duration::from_secs(6);
        assert!(!arbiter.evaluate_peer(late));
        assert_eq!(arbiter.role(), Role::Master);
        assert_eq!(arbiter.term(), 0);

        let disabled = settings(Role::Slave, 10);
        let arbiter = Arbiter::new(disabled);
        assert!(!arbiter.evaluate_peer(Instant::now() + Duration::from_secs(6)));
        assert_eq!(arbiter.role(), Role::Slave);
    }

    #[test]
    fn health_reflects_both_flags() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        let link = FakeLink::default();
        assert!(!arbiter.health().is_ok());
        arbiter.handle_fleet(FleetPayload::EcsConnected(true), &link);
        arbiter.handle_fleet(FleetPayload::FleetConnected(true), &link);
        assert!(arbiter.health().is_ok());
    }

    #[test]
    fn arbiter_claim_snapshot_is_stored() {
        let arbiter = Arbiter::new(settings(Role::Slave, 10));
        arbiter.handle_peer(StatusPayload::Arbiter(claim(Role::Master, 1, 20)));
        let status = arbiter.status();
        assert_eq!(status.peer.as_ref().map(|c| c.term), Some(1));
        assert_eq!(status.term, 1);
        assert_eq!(status.role, Role::Slave);
    }
}
