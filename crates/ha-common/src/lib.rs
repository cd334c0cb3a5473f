//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Shared primitives for the fleet-ha arbiter runtime."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! Configuration loading and tracing initialisation shared by every
//! fleet-ha crate. The configuration value is constructed once at startup
//! and passed by reference into each component constructor; there is no
//! process-wide singleton.

pub mod config;
pub mod logging;

pub use config::{AppConfig, Role};
pub use logging::init_tracing;
