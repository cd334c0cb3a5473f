//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Arbitration core: election state machine and staleness monitors."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! The arbitration core. One [`Arbiter`] per process owns role, term and
//! the two connectivity snapshots behind a single read-write lock; the
//! staleness monitors and the REST projection read through it, message
//! handlers and the resolution rule write through it.

pub mod arbiter;
pub mod monitor;

/// Control surface the arbiter and monitors use to read or force the
/// connected flag of a transport link without depending on the network
/// layer.
pub trait LinkControl: Send + Sync + 'static {
    /// Whether the link currently believes its transport is up.
    fn is_connected(&self) -> bool;
    /// Force the connected flag; used when Fleet revokes its own
    /// connectivity acknowledgment.
    fn set_connected(&self, connected: bool);
}

pub use arbiter::{Arbiter, ArbiterSettings, Connectivity, HealthSnapshot, StatusSnapshot};
pub use monitor::StalenessMonitor;
