//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Network edge: duplex links, peer sessions, health projection."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! The network edge of a fleet-ha node. Bytes enter the system in exactly
//! two places: the resilient duplex links ([`link`]) and the peer session
//! registry ([`peer_server`]); both hand decoded messages to the arbiter
//! through owned channels. [`rest`] exposes the read-only health
//! projection.

pub mod link;
pub mod peer_server;
pub mod rest;

/// Errors surfaced by the network edge. Transient transport failures are
/// recovered locally by the owning loop and never escalate past it.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// No live stream exists for this link.
    #[error("link is not connected")]
    NotConnected,
    /// The outbound stream handle closed underneath a send.
    #[error("outbound stream closed")]
    ChannelClosed,
    /// Transport-level failure while dialing or serving.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    /// RPC-level failure while opening a stream.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    /// Targeted send to a session id that is not registered.
    #[error("no active session {0}")]
    SessionNotFound(u64),
}

pub use link::{FleetDialer, LinkSettings, PeerDialer, ResilientLink, StreamDialer};
pub use peer_server::{PeerRegistry, PeerServerBuilder, PeerServerHandle};
pub use rest::{HealthProvider, RestApiBuilder, RestApiHandle};
