//! Heartbeat telemetry events (spec §6). Separate from [`crate::sdam::listener::DescriptionListener`]:
//! these are fire-and-forget observability, not the contract the topology aggregator depends on.

use std::time::Duration;

use serde::Serialize;

use crate::{
    cmap::ConnectionId,
    error::Error,
    options::ServerAddress,
    sdam::ServerDescription,
    serde_util,
};

/// Published when a server description changes (spec §6). Mirrors the transition a monitor's
/// [`crate::sdam::DescriptionListener`] just observed, for applications that only want to observe
/// SDAM as telemetry rather than act as the topology aggregator.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    pub server_address: ServerAddress,

    pub previous_description: ServerDescription,

    pub new_description: ServerDescription,
}

/// Published when a heartbeat probe is about to be sent. Not published for the very first
/// handshake attempt on a freshly opened connection (spec §8, scenario 1).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    pub server_address: ServerAddress,

    #[serde(skip)]
    pub connection_id: ConnectionId,

    /// Whether this heartbeat is a streaming/exhaust probe.
    pub awaited: bool,
}

/// Published when a heartbeat probe receives a reply.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    pub server_address: ServerAddress,

    #[serde(skip)]
    pub connection_id: ConnectionId,

    pub duration: Duration,

    pub awaited: bool,
}

/// Published when a heartbeat probe fails.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    pub server_address: ServerAddress,

    #[serde(skip)]
    pub connection_id: ConnectionId,

    pub duration: Duration,

    #[serde(serialize_with = "serde_util::serialize_error_as_string")]
    pub failure: Error,

    pub awaited: bool,
}

/// A human-readable breadcrumb for an unexpected (bug-like) internal error caught at the
/// heartbeat loop boundary (spec §4.1, §7): the monitor must not crash, so these surface here
/// instead.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SdamInformationEvent {
    pub server_address: ServerAddress,

    pub message: String,
}

/// Applications can implement this trait to observe heartbeat telemetry without participating in
/// the monitor's description-change contract (that's [`crate::sdam::listener::DescriptionListener`]).
pub trait SdamEventHandler: Send + Sync {
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}

    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    fn handle_sdam_information_event(&self, _event: SdamInformationEvent) {}
}
