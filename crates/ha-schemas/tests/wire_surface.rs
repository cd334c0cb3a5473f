//! ---
//! ha_section: "02-status-sync-protocol"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Exercises the crate-root wire vocabulary surface."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! Uses the crate exactly as the network layer does: everything it
//! needs must be reachable from the crate root.

use ha_common::config::Role;
use ha_schemas::v1::client_message;
use ha_schemas::{client_heartbeat, PeerClaim, StatusPayload};

#[test]
fn fleet_heartbeat_is_constructible_from_the_crate_root() {
    let msg = client_heartbeat();
    assert!(matches!(
        msg.payload,
        Some(client_message::Payload::Hb(ts)) if ts > 0
    ));
}

#[test]
fn status_request_encoding_is_reachable_from_the_crate_root() {
    let claim = PeerClaim {
        name: "ha-a".into(),
        role: Role::Master,
        term: 1,
        priority: 10,
    };
    let request: ha_schemas::v1::StatusRequest = StatusPayload::Arbiter(claim.clone()).into();
    assert_eq!(
        StatusPayload::try_from(request).unwrap(),
        StatusPayload::Arbiter(claim)
    );
}
