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

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{Arbiter, LinkControl};

/// Spawns the periodic staleness evaluations. Each monitor converts
/// "time since last observed liveness signal" into a connectivity
/// verdict on a fixed cadence, independent of the links' reconnect
/// cadence.
#[derive(Debug, Clone, Copy)]
pub struct StalenessMonitor {
    poll_interval: Duration,
}

impl StalenessMonitor {
    /// Monitor ticking at the given interval (1 s in the default
    /// configuration).
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Watch the Fleet link. The verdict additionally requires the
    /// transport's own connected flag: a fresh timestamp from an earlier
    /// session cannot outvote a dead transport.
    pub fn spawn_fleet(
        &self,
        arbiter: Arc<Arbiter>,
        fleet_link: Arc<dyn LinkControl>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let verdict =
                            arbiter.evaluate_fleet(Instant::now(), fleet_link.is_connected());
                        if !verdict {
                            warn!(
                                timeout_secs = arbiter.fleet_timeout().as_secs(),
                                "fleet heartbeat stale; marking fleet unreachable"
                            );
                        }
                    }
                }
            }
            debug!("fleet staleness monitor stopped");
        })
    }

    /// Watch the peer heartbeat and keep `other.ha` current.
    pub fn spawn_peer(
        &self,
        arbiter: Arc<Arbiter>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !arbiter.evaluate_peer(Instant::now()) {
                            warn!(
                                timeout_secs = arbiter.peer_timeout().as_secs(),
                                "peer heartbeat stale; marking peer unreachable"
                            );
                        }
                    }
                }
            }
            debug!("peer staleness monitor stopped");
        })
    }
}
