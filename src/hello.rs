//! The probe command itself: construction of the polling/streaming `hello` command (spec §6) and
//! the reply shape the monitor reads fields out of.

use std::{collections::BTreeMap, time::Duration};

use bson::{doc, oid::ObjectId, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::sdam::{ServerType, TopologyVersion};

/// The legacy command name, retained because some deployments still only understand it.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Options that turn a plain polling probe into a streaming ("awaitable") one (spec §4.1 step 3,
/// §6).
#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// A probe command ready to be sent over a connection.
#[derive(Debug, Clone)]
pub(crate) struct HelloCommand {
    pub(crate) body: Document,
    /// Whether the transport should keep the connection in exhaust-allowed mode, expecting
    /// further server-pushed frames without another request (spec §4.1 step 3).
    pub(crate) exhaust_allowed: bool,
}

/// Builds a `hello`/legacy-hello command, optionally in its streaming form.
///
/// If `awaitable_options` is `Some`, the command carries `topologyVersion` and `maxAwaitTimeMS`
/// and is marked exhaust-allowed, matching spec §6's streaming probe shape. A
/// `speculative_authenticate` document, if supplied by the pluggable [`crate::auth::Authenticator`],
/// is attached verbatim.
pub(crate) fn hello_command(
    awaitable_options: Option<AwaitableHelloOptions>,
    speculative_authenticate: Option<Document>,
) -> HelloCommand {
    let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1, "helloOk": true };

    if let Some(opts) = awaitable_options {
        body.insert("topologyVersion", opts.topology_version);
        body.insert(
            "maxAwaitTimeMS",
            opts.max_await_time.as_millis().min(i64::MAX as u128) as i64,
        );
    }

    if let Some(doc) = speculative_authenticate {
        body.insert("speculativeAuthenticate", doc);
    }

    HelloCommand {
        body,
        exhaust_allowed: awaitable_options.is_some(),
    }
}

/// The parsed reply to a `hello`/legacy-hello command.
#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw: Document,
}

/// The fields this core reads out of a `hello` reply (spec §6). Fields owned by the topology
/// aggregator (`hosts`/`passives`/`arbiters`) are parsed so they round-trip through `raw` but are
/// not otherwise interpreted here.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    pub ok: Option<f64>,

    pub code: Option<i32>,

    pub errmsg: Option<String>,

    #[serde(alias = "ismaster")]
    pub is_writable_primary: Option<bool>,

    pub secondary: Option<bool>,

    pub arbiter_only: Option<bool>,

    pub hidden: Option<bool>,

    pub set_name: Option<String>,

    pub set_version: Option<i32>,

    pub election_id: Option<ObjectId>,

    pub me: Option<String>,

    pub hosts: Option<Vec<String>>,

    pub passives: Option<Vec<String>>,

    pub arbiters: Option<Vec<String>>,

    pub tags: Option<BTreeMap<String, String>>,

    pub logical_session_timeout_minutes: Option<i64>,

    pub min_wire_version: Option<i32>,

    pub max_wire_version: Option<i32>,

    pub max_bson_object_size: Option<i64>,

    pub max_message_size_bytes: Option<i64>,

    pub max_write_batch_size: Option<i64>,

    pub topology_version: Option<TopologyVersion>,

    pub last_write: Option<LastWrite>,

    /// Contains `"isdbgrid"` when the reply came from a shard router.
    pub msg: Option<String>,

    #[serde(skip)]
    pub version: Option<String>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::ShardRouter;
        }

        if self.set_name.is_some() {
            return if self.hidden == Some(true) {
                ServerType::ReplicaSetOther
            } else if self.is_writable_primary == Some(true) {
                ServerType::ReplicaSetPrimary
            } else if self.secondary == Some(true) {
                ServerType::ReplicaSetSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::ReplicaSetArbiter
            } else {
                ServerType::ReplicaSetOther
            };
        }

        if self.is_writable_primary.is_none() && self.ok == Some(1.0) {
            return ServerType::ReplicaSetGhost;
        }

        ServerType::Standalone
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}
