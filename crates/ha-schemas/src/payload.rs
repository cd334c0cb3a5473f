//! ---
//! ha_section: "02-status-sync-protocol"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Status sync wire schema and decoded payload model."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
use chrono::Utc;
use serde::{Deserialize, Serialize};

use ha_common::config::Role;

use crate::v1::{client_message, server_message, status_request, status_response};
use crate::v1::{ClientMessage, PeerArbiter, ServerMessage, StatusRequest, StatusResponse};

/// Decoding failures for inbound wire messages. A failed decode drops the
/// single offending message; the stream is never torn down for it.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    /// The oneof carried no recognized variant (empty or from a newer schema).
    #[error("unrecognized or empty {0} payload")]
    UnknownPayload(&'static str),
    /// The peer arbitration record carried an undefined role value.
    #[error("unknown role value {0} in peer arbitration record")]
    UnknownRole(i32),
}

/// Arbitration facts reported by the remote instance. Transient: the
/// arbiter overwrites its copy on every peer status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerClaim {
    /// Remote node name.
    pub name: String,
    /// Role the remote node believes it holds.
    pub role: Role,
    /// Election epoch counter of the remote node.
    pub term: i32,
    /// Static tie-break value of the remote node.
    pub priority: i32,
}

impl TryFrom<PeerArbiter> for PeerClaim {
    type Error = SchemaError;

    fn try_from(record: PeerArbiter) -> Result<Self, Self::Error> {
        let role = Role::from_wire(record.role).ok_or(SchemaError::UnknownRole(record.role))?;
        Ok(Self {
            name: record.name,
            role,
            term: record.term,
            priority: record.priority,
        })
    }
}

impl From<PeerClaim> for PeerArbiter {
    fn from(claim: PeerClaim) -> Self {
        Self {
            name: claim.name,
            role: claim.role.as_wire(),
            term: claim.term,
            priority: claim.priority,
        }
    }
}

/// Decoded message arriving from the Fleet backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetPayload {
    /// Liveness signal carrying a unix timestamp.
    Heartbeat(i32),
    /// Reachability of the backend ECS service, observed by Fleet.
    EcsConnected(bool),
    /// Fleet's own acknowledgment of the dispatch link.
    FleetConnected(bool),
}

impl TryFrom<ServerMessage> for FleetPayload {
    type Error = SchemaError;

    fn try_from(msg: ServerMessage) -> Result<Self, Self::Error> {
        match msg.payload {
            Some(server_message::Payload::Hb(ts)) => Ok(FleetPayload::Heartbeat(ts)),
            Some(server_message::Payload::IsEcsConnected(v)) => Ok(FleetPayload::EcsConnected(v)),
            Some(server_message::Payload::IsFleetConnected(v)) => {
                Ok(FleetPayload::FleetConnected(v))
            }
            None => Err(SchemaError::UnknownPayload("fleet server message")),
        }
    }
}

/// Decoded message exchanged between the two HA instances. Both stream
/// directions carry the same vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusPayload {
    /// Liveness signal carrying a unix timestamp.
    Heartbeat(i32),
    /// The peer's self-reported HA uplink state.
    HaConnected(bool),
    /// The peer's measured ECS reachability.
    EcsConnected(bool),
    /// The peer's measured Fleet reachability.
    FleetConnected(bool),
    /// The peer's arbitration record; drives the resolution rule.
    Arbiter(PeerClaim),
}

impl StatusPayload {
    /// Heartbeat payload stamped with the current wall-clock time.
    pub fn heartbeat_now() -> Self {
        StatusPayload::Heartbeat(unix_ts())
    }
}

impl TryFrom<StatusRequest> for StatusPayload {
    type Error = SchemaError;

    fn try_from(msg: StatusRequest) -> Result<Self, Self::Error> {
        match msg.payload {
            Some(status_request::Payload::Hb(ts)) => Ok(StatusPayload::Heartbeat(ts)),
            Some(status_request::Payload::IsHaConnected(v)) => Ok(StatusPayload::HaConnected(v)),
            Some(status_request::Payload::IsEcsConnected(v)) => Ok(StatusPayload::EcsConnected(v)),
            Some(status_request::Payload::IsFleetConnected(v)) => {
                Ok(StatusPayload::FleetConnected(v))
            }
            Some(status_request::Payload::PeerArbiter(record)) => {
                Ok(StatusPayload::Arbiter(record.try_into()?))
            }
            None => Err(SchemaError::UnknownPayload("status request")),
        }
    }
}

impl TryFrom<StatusResponse> for StatusPayload {
    type Error = SchemaError;

    fn try_from(msg: StatusResponse) -> Result<Self, Self::Error> {
        match msg.payload {
            Some(status_response::Payload::Hb(ts)) => Ok(StatusPayload::Heartbeat(ts)),
            Some(status_response::Payload::IsHaConnected(v)) => Ok(StatusPayload::HaConnected(v)),
            Some(status_response::Payload::IsEcsConnected(v)) => Ok(StatusPayload::EcsConnected(v)),
            Some(status_response::Payload::IsFleetConnected(v)) => {
                Ok(StatusPayload::FleetConnected(v))
            }
            Some(status_response::Payload::PeerArbiter(record)) => {
                Ok(StatusPayload::Arbiter(record.try_into()?))
            }
            None => Err(SchemaError::UnknownPayload("status response")),
        }
    }
}

impl From<StatusPayload> for StatusRequest {
    fn from(payload: StatusPayload) -> Self {
        let payload = match payload {
            StatusPayload::Heartbeat(ts) => status_request::Payload::Hb(ts),
            StatusPayload::HaConnected(v) => status_request::Payload::IsHaConnected(v),
            StatusPayload::EcsConnected(v) => status_request::Payload::IsEcsConnected(v),
            StatusPayload::FleetConnected(v) => status_request::Payload::IsFleetConnected(v),
            StatusPayload::Arbiter(claim) => status_request::Payload::PeerArbiter(claim.into()),
        };
        Self {
            payload: Some(payload),
        }
    }
}

impl From<StatusPayload> for StatusResponse {
    fn from(payload: StatusPayload) -> Self {
        let payload = match payload {
            StatusPayload::Heartbeat(ts) => status_response::Payload::Hb(ts),
            StatusPayload::HaConnected(v) => status_response::Payload::IsHaConnected(v),
            StatusPayload::EcsConnected(v) => status_response::Payload::IsEcsConnected(v),
            StatusPayload::FleetConnected(v) => status_response::Payload::IsFleetConnected(v),
            StatusPayload::Arbiter(claim) => status_response::Payload::PeerArbiter(claim.into()),
        };
        Self {
            payload: Some(payload),
        }
    }
}

/// Heartbeat message sent towards the Fleet backend.
pub fn client_heartbeat() -> ClientMessage {
    ClientMessage {
        payload: Some(client_message::Payload::Hb(unix_ts())),
    }
}

fn unix_ts() -> i32 {
    // The original schema fixed this field at 32 bits; good until 2038.
    Utc::now().timestamp() as i32
}
