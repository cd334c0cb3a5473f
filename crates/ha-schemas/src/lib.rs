//! ---
//! ha_section: "02-status-sync-protocol"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Status sync wire schema and decoded payload model."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! Generated gRPC types for the status sync protocol plus the decoded
//! payload model consumed by the arbiter. Other crates depend on this
//! crate as the single source of truth for the wire vocabulary.

pub mod payload;

/// Generated protobuf/tonic modules.
pub mod proto {
    pub mod fleet {
        pub mod ha {
            pub mod v1 {
                tonic::include_proto!("fleet.ha.v1");
            }
        }
    }
}

pub use payload::{client_heartbeat, FleetPayload, PeerClaim, SchemaError, StatusPayload};
pub use proto::fleet::ha::v1;
