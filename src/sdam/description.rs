//! `ServerId` and `ServerDescription`: the value types a monitor publishes (spec §3).

use std::collections::BTreeMap;

use bson::{oid::ObjectId, DateTime};
use serde::Serialize;

use super::topology_version::TopologyVersion;
use crate::{
    error::Error,
    hello::HelloReply,
    options::{ClusterId, ServerAddress},
    serde_util,
};

/// The immutable identity of a monitored server: which topology it belongs to, and its address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerId {
    pub cluster_id: ClusterId,
    pub address: ServerAddress,
}

/// The kind of server behind an endpoint, inferred from its `hello` reply (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[non_exhaustive]
pub enum ServerType {
    #[default]
    Unknown,
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ReplicaSetArbiter,
    ReplicaSetOther,
    ReplicaSetGhost,
    ShardRouter,
    LoadBalancer,
}

impl ServerType {
    pub fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// Whether a server is currently reachable (spec §3, `state` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Disconnected,
    Connected,
}

/// The driver's supported wire version range, used to compute `is_compatible_with_driver` (spec
/// §4.1).
const DRIVER_MIN_WIRE_VERSION: i32 = 0;
const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// The inclusive `[min, max]` wire protocol version range a server reports supporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireVersionRange {
    pub min: i32,
    pub max: i32,
}

impl WireVersionRange {
    /// Whether this range overlaps `[driver_min, driver_max]` (spec §4.1, `isCompatibleWithDriver`).
    pub fn overlaps(&self, driver_min: i32, driver_max: i32) -> bool {
        self.min <= driver_max && self.max >= driver_min
    }
}

/// An immutable snapshot of the most up-to-date information known about a server.
///
/// Invariants (spec §3, §8): `type = Unknown ⇒ state = Disconnected`; `state = Connected ⇒
/// last_heartbeat_exception = None ∧ wire_version_range = Some(_) ∧ type ≠ Unknown`. Every
/// instance is built via [`ServerDescription::unknown`] followed by at most one of
/// [`ServerDescription::from_hello`]/[`ServerDescription::from_error`] — never derived from a
/// prior instance — so a bug in one derivation can't compound into the next (spec §9).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescription {
    pub server_id: ServerId,
    pub server_type: ServerType,
    pub state: ServerState,
    pub wire_version_range: Option<WireVersionRange>,
    pub tags: BTreeMap<String, String>,
    #[serde(serialize_with = "serde_util::serialize_duration_option_as_int_millis")]
    pub average_round_trip_time: Option<std::time::Duration>,
    pub last_heartbeat_timestamp: Option<DateTime>,
    pub last_update_timestamp: Option<DateTime>,
    #[serde(serialize_with = "serde_util::serialize_optional_error_as_string")]
    pub last_heartbeat_exception: Option<Error>,
    pub election_id: Option<ObjectId>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    #[serde(serialize_with = "serde_util::serialize_duration_option_as_int_millis")]
    pub logical_session_timeout: Option<std::time::Duration>,
    pub topology_version: Option<TopologyVersion>,
    pub canonical_address: Option<String>,
    pub max_write_batch_size: Option<i64>,
    pub max_bson_object_size: Option<i64>,
    pub max_message_size_bytes: Option<i64>,
    /// Whether `wire_version_range` overlaps the driver's supported range (spec §4.1). An
    /// out-of-range server still publishes `state = Connected`; only this flag reflects the
    /// incompatibility.
    pub is_compatible_with_driver: bool,
    /// Diagnostic note on why this description was produced, e.g. `"Heartbeat"` (spec §3).
    pub reason_changed: &'static str,
}

impl ServerDescription {
    /// The base description every derivation starts from: `Unknown`/`Disconnected`, with no
    /// prior observation carried over.
    pub fn unknown(server_id: ServerId) -> Self {
        ServerDescription {
            server_id,
            server_type: ServerType::Unknown,
            state: ServerState::Disconnected,
            wire_version_range: None,
            tags: BTreeMap::new(),
            average_round_trip_time: None,
            last_heartbeat_timestamp: None,
            last_update_timestamp: Some(DateTime::now()),
            last_heartbeat_exception: None,
            election_id: None,
            set_name: None,
            set_version: None,
            logical_session_timeout: None,
            topology_version: None,
            canonical_address: None,
            max_write_batch_size: None,
            max_bson_object_size: None,
            max_message_size_bytes: None,
            is_compatible_with_driver: true,
            reason_changed: "Initial",
        }
    }

    /// Derives a `Connected` description from a successful probe reply (spec §4.1 step 5).
    pub fn from_hello(
        server_id: ServerId,
        reply: &HelloReply,
        average_round_trip_time: std::time::Duration,
    ) -> Self {
        let response = &reply.command_response;
        let mut base = Self::unknown(server_id);

        base.server_type = response.server_type();
        base.state = ServerState::Connected;
        base.wire_version_range = match (response.min_wire_version, response.max_wire_version) {
            (Some(min), Some(max)) => Some(WireVersionRange { min, max }),
            _ => None,
        };
        base.tags = response.tags.clone().unwrap_or_default();
        base.election_id = response.election_id;
        base.set_name = response.set_name.clone();
        base.set_version = response.set_version;
        base.logical_session_timeout = response
            .logical_session_timeout_minutes
            .map(|m| std::time::Duration::from_secs((m.max(0) as u64) * 60));
        base.canonical_address = response.me.clone();
        base.topology_version = response.topology_version;
        base.average_round_trip_time = Some(average_round_trip_time);
        base.last_heartbeat_timestamp = Some(DateTime::now());
        base.max_write_batch_size = response.max_write_batch_size;
        base.max_bson_object_size = response.max_bson_object_size;
        base.max_message_size_bytes = response.max_message_size_bytes;
        base.is_compatible_with_driver = base
            .wire_version_range
            .map(|range| range.overlaps(DRIVER_MIN_WIRE_VERSION, DRIVER_MAX_WIRE_VERSION))
            .unwrap_or(true);
        base.reason_changed = "Heartbeat";

        base
    }

    /// Derives an `Unknown`/`Disconnected` description after a failed probe (spec §4.1 step 5,
    /// §7).
    pub fn from_error(server_id: ServerId, error: Error) -> Self {
        let topology_version = error.topology_version();
        let mut base = Self::unknown(server_id);
        base.last_heartbeat_exception = Some(error);
        base.topology_version = topology_version;
        base.last_heartbeat_timestamp = Some(DateTime::now());
        base.reason_changed = "Heartbeat";
        base
    }

    /// Whether the last response indicated streaming/exhaust support: it carried a
    /// `topologyVersion` and the server was reachable (spec §9, "single boolean... driven by
    /// 'last response carried a topologyVersion'").
    pub fn supports_streaming(&self) -> bool {
        self.server_type.is_available() && self.topology_version.is_some()
    }
}
