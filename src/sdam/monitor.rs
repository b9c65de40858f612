//! `ServerMonitor`: the heartbeat state machine (spec §4.1).

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bson::Document;
use tokio_util::sync::CancellationToken;

use super::{
    description::ServerDescription,
    listener::{DescriptionListener, TopologyClock},
    rtt::RoundTripTimeMonitor,
    scheduler::{HeartbeatDelay, Metronome},
    topology_version::compare_freshness_opt,
    ServerId,
};
use crate::{
    auth::{Authenticator, NoopAuthenticator},
    cmap::{CommandResponse, Connection, ConnectionFactory, ConnectionId},
    error::{CommandError, Error, ErrorKind, Result},
    event::sdam::{
        SdamEventHandler, SdamInformationEvent, ServerDescriptionChangedEvent,
        ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent, ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, AwaitableHelloOptions, HelloCommandResponse, HelloReply},
    options::ServerMonitoringSettings,
    runtime::{self, AsyncJoinHandle},
};

const LIFECYCLE_INITIAL: u8 = 0;
const LIFECYCLE_OPEN: u8 = 1;
const LIFECYCLE_DISPOSED: u8 = 2;

/// `tracing` target for this module's events, enabled only under the `tracing-unstable` feature.
#[cfg(feature = "tracing-unstable")]
const TRACING_TARGET: &str = "sdam_core::monitor";

struct Attempt {
    connection: Option<Box<dyn Connection>>,
    /// Set when the previous read reported `more_to_come`: the next attempt should read the
    /// server's next pushed frame rather than send a new command.
    pending_exhaust: bool,
    token: CancellationToken,
}

struct Inner {
    server_id: ServerId,
    connection_factory: Arc<dyn ConnectionFactory>,
    settings: ServerMonitoringSettings,
    listener: Arc<dyn DescriptionListener>,
    event_handler: Option<Arc<dyn SdamEventHandler>>,
    authenticator: Arc<dyn Authenticator>,
    topology_clock: Option<Arc<dyn TopologyClock>>,

    lifecycle: AtomicU8,
    initialized: AtomicBool,

    description: Mutex<Arc<ServerDescription>>,
    attempt: Mutex<Attempt>,
    root_token: CancellationToken,
    rtt_monitor: Arc<RoundTripTimeMonitor>,
    heartbeat_delay: Mutex<Option<Arc<HeartbeatDelay>>>,

    heartbeat_task: Mutex<Option<AsyncJoinHandle<()>>>,
    rtt_task: Mutex<Option<AsyncJoinHandle<()>>>,
}

/// Continuously probes one server, publishing `ServerDescription` changes to a
/// [`DescriptionListener`] (spec §4.1).
///
/// Cheaply [`Clone`]-able: all state lives behind an inner `Arc`, so callers can hand the same
/// monitor to multiple tasks (the topology layer, a CLI command handler, ...) without wrapping it
/// themselves.
#[derive(Clone)]
pub struct ServerMonitor {
    inner: Arc<Inner>,
}

impl ServerMonitor {
    pub(crate) fn new(
        server_id: ServerId,
        connection_factory: Arc<dyn ConnectionFactory>,
        settings: ServerMonitoringSettings,
        listener: Arc<dyn DescriptionListener>,
    ) -> Self {
        Self::new_with_auth(
            server_id,
            connection_factory,
            settings,
            listener,
            None,
            Arc::new(NoopAuthenticator),
        )
    }

    pub(crate) fn new_with_auth(
        server_id: ServerId,
        connection_factory: Arc<dyn ConnectionFactory>,
        settings: ServerMonitoringSettings,
        listener: Arc<dyn DescriptionListener>,
        event_handler: Option<Arc<dyn SdamEventHandler>>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self::new_full(
            server_id,
            connection_factory,
            settings,
            listener,
            event_handler,
            authenticator,
            None,
        )
    }

    /// The full constructor: binds every collaborator a monitor can have, including the
    /// topology aggregator's [`TopologyClock`] (spec §2) used to reject a probe response whose
    /// `topologyVersion` is staler than what the aggregator already knows.
    pub(crate) fn new_full(
        server_id: ServerId,
        connection_factory: Arc<dyn ConnectionFactory>,
        settings: ServerMonitoringSettings,
        listener: Arc<dyn DescriptionListener>,
        event_handler: Option<Arc<dyn SdamEventHandler>>,
        authenticator: Arc<dyn Authenticator>,
        topology_clock: Option<Arc<dyn TopologyClock>>,
    ) -> Self {
        let root_token = CancellationToken::new();
        let rtt_monitor = Arc::new(RoundTripTimeMonitor::new(
            server_id.address.clone(),
            connection_factory.clone(),
            settings.connect_timeout,
        ));
        let initial = Arc::new(ServerDescription::unknown(server_id.clone()));

        let inner = Inner {
            server_id,
            connection_factory,
            settings,
            listener,
            event_handler,
            authenticator,
            topology_clock,
            lifecycle: AtomicU8::new(LIFECYCLE_INITIAL),
            initialized: AtomicBool::new(false),
            description: Mutex::new(initial),
            attempt: Mutex::new(Attempt {
                connection: None,
                pending_exhaust: false,
                token: root_token.child_token(),
            }),
            root_token,
            rtt_monitor,
            heartbeat_delay: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            rtt_task: Mutex::new(None),
        };

        ServerMonitor { inner: Arc::new(inner) }
    }

    /// Transitions Initial -> Open and starts the heartbeat and RTT loops. A second call is a
    /// no-op (spec §4.1).
    pub fn initialize(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.lifecycle.store(LIFECYCLE_OPEN, Ordering::SeqCst);

        let heartbeat_inner = self.inner.clone();
        let heartbeat_handle = runtime::spawn(Inner::run_heartbeat_loop(heartbeat_inner));
        *self.inner.heartbeat_task.lock().unwrap() = Some(heartbeat_handle);

        let rtt_monitor = self.inner.rtt_monitor.clone();
        let heartbeat_interval = self.inner.settings.heartbeat_interval;
        let rtt_handle = runtime::spawn(async move { rtt_monitor.run(heartbeat_interval).await });
        *self.inner.rtt_task.lock().unwrap() = Some(rtt_handle);
    }

    /// Returns the latest published snapshot. Never blocks on network I/O.
    pub fn description(&self) -> ServerDescription {
        (*self.inner.description.lock().unwrap()).as_ref().clone()
    }

    /// Wakes the scheduler so the next probe runs after at most `min_heartbeat_interval` rather
    /// than the full `heartbeat_interval` (spec §4.1).
    pub fn request_heartbeat(&self) -> Result<()> {
        self.inner.ensure_open()?;
        if let Some(delay) = self.inner.heartbeat_delay.lock().unwrap().as_ref() {
            delay.request_early_wake();
        }
        Ok(())
    }

    /// Aborts any in-flight probe, ensuring the next attempt starts with a fresh connection and a
    /// fresh per-attempt cancellation token (spec §4.1, §5, §9).
    pub fn cancel_current_check(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut attempt = self.inner.attempt.lock().unwrap();
        attempt.token.cancel();
        attempt.connection = None;
        attempt.pending_exhaust = false;
        attempt.token = self.inner.root_token.child_token();
        Ok(())
    }

    /// Transitions to Disposed. Idempotent; no further events are emitted after this returns.
    pub fn dispose(&self) {
        if self.inner.lifecycle.swap(LIFECYCLE_DISPOSED, Ordering::SeqCst) == LIFECYCLE_DISPOSED {
            return;
        }
        self.inner.root_token.cancel();
        if let Some(delay) = self.inner.heartbeat_delay.lock().unwrap().as_ref() {
            delay.dispose();
        }
        self.inner.rtt_monitor.dispose();
        if let Some(handle) = self.inner.heartbeat_task.lock().unwrap().as_ref() {
            handle.abort();
        }
        if let Some(handle) = self.inner.rtt_task.lock().unwrap().as_ref() {
            handle.abort();
        }
    }
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_DISPOSED
    }

    fn ensure_open(&self) -> Result<()> {
        match self.lifecycle.load(Ordering::SeqCst) {
            LIFECYCLE_INITIAL => Err(ErrorKind::NotInitialized.into()),
            LIFECYCLE_DISPOSED => Err(ErrorKind::Disposed.into()),
            _ => Ok(()),
        }
    }

    fn snapshot_description(&self) -> Arc<ServerDescription> {
        self.description.lock().unwrap().clone()
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut metronome = Metronome::new(self.settings.heartbeat_interval);

        while !self.is_disposed() {
            let delay = Arc::new(HeartbeatDelay::new(
                metronome.next_tick_delay(),
                self.settings.min_heartbeat_interval,
            ));
            *self.heartbeat_delay.lock().unwrap() = Some(delay.clone());
            delay.wait().await;

            if self.is_disposed() {
                return;
            }

            loop {
                if self.is_disposed() {
                    return;
                }
                if !self.run_one_attempt().await {
                    break;
                }
            }
        }
    }

    /// Runs a single probe acquisition/derivation/publication cycle (spec §4.1 steps 3-7).
    /// Returns `true` if the inner attempt loop should continue immediately.
    async fn run_one_attempt(self: &Arc<Self>) -> bool {
        let (connection, pending_exhaust, token) = {
            let mut attempt = self.attempt.lock().unwrap();
            (
                attempt.connection.take(),
                attempt.pending_exhaust,
                attempt.token.clone(),
            )
        };

        let previous = self.snapshot_description();
        let wants_streaming = previous.supports_streaming();

        let probe = self.clone().acquire_probe(connection, pending_exhaust, wants_streaming, previous.clone());

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.on_cancelled();
                false
            }
            outcome = probe => {
                self.on_probe_outcome(outcome, previous).await
            }
        }
    }

    /// Opens a connection or reuses the existing one and performs exactly one probe I/O
    /// operation (spec §4.1 step 3). Owns `connection` for the duration so that dropping this
    /// future (on cancellation) closes it.
    async fn acquire_probe(
        self: Arc<Self>,
        connection: Option<Box<dyn Connection>>,
        pending_exhaust: bool,
        wants_streaming: bool,
        previous: Arc<ServerDescription>,
    ) -> ProbeOutcome {
        match connection {
            Some(mut conn) if pending_exhaust => {
                let id = conn.id();
                self.emit_started(id, true);
                let start = Instant::now();
                let result = self.bound_by_read_timeout(true, conn.receive_more()).await;
                ProbeOutcome {
                    connection: Some(conn),
                    connection_id: id,
                    elapsed: start.elapsed(),
                    result,
                    was_awaited: true,
                    was_new_connection: false,
                }
            }
            Some(mut conn) => {
                let id = conn.id();
                self.emit_started(id, wants_streaming);
                let command = self.build_command(wants_streaming, &previous);
                let start = Instant::now();
                let result = self
                    .bound_by_read_timeout(wants_streaming, conn.command(command, wants_streaming))
                    .await;
                ProbeOutcome {
                    connection: Some(conn),
                    connection_id: id,
                    elapsed: start.elapsed(),
                    result,
                    was_awaited: wants_streaming,
                    was_new_connection: false,
                }
            }
            None => {
                let start = Instant::now();
                match self
                    .connection_factory
                    .connect(&self.server_id.address, self.settings.connect_timeout)
                    .await
                {
                    Ok(mut conn) => {
                        let id = conn.id();
                        let command = self.build_command(false, &previous);
                        let result = self
                            .bound_by_read_timeout(false, conn.command(command, false))
                            .await;
                        let result = match result {
                            Ok(response) => self.authenticate(&response.body).await.map(|_| response),
                            Err(e) => Err(e),
                        };
                        ProbeOutcome {
                            connection: Some(conn),
                            connection_id: id,
                            elapsed: start.elapsed(),
                            result,
                            was_awaited: false,
                            was_new_connection: true,
                        }
                    }
                    Err(e) => ProbeOutcome {
                        connection: None,
                        connection_id: ConnectionId(0),
                        elapsed: start.elapsed(),
                        result: Err(e),
                        was_awaited: false,
                        was_new_connection: true,
                    },
                }
            }
        }
    }

    /// Bounds a single probe read by `heartbeat_timeout`, extended by one `heartbeat_interval`
    /// for a streaming/exhaust read since the server may legitimately hold the connection open
    /// for up to `maxAwaitTimeMS` before replying (spec §4.1 step 3).
    async fn bound_by_read_timeout<F, T>(&self, awaited: bool, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let mut bound = self.settings.heartbeat_timeout;
        if awaited {
            bound += self.settings.heartbeat_interval;
        }

        match tokio::time::timeout(bound, fut).await {
            Ok(result) => result,
            Err(_) => Err(ErrorKind::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("heartbeat to {} timed out after {bound:?}", self.server_id.address),
            )))
            .into()),
        }
    }

    async fn authenticate(&self, handshake_reply: &Document) -> Result<()> {
        let speculative_reply = handshake_reply
            .get_document("speculativeAuthenticate")
            .ok()
            .cloned();
        self.authenticator
            .authenticate(speculative_reply.as_ref())
            .await
    }

    fn build_command(&self, streaming: bool, previous: &ServerDescription) -> Document {
        let awaitable = if streaming {
            previous.topology_version.map(|topology_version| AwaitableHelloOptions {
                topology_version,
                max_await_time: self.settings.heartbeat_interval,
            })
        } else {
            None
        };
        let speculative = self.authenticator.speculative_authenticate_document();
        hello_command(awaitable, speculative).body
    }

    fn on_cancelled(&self) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(
            target: TRACING_TARGET,
            server_address = %self.server_id.address,
            "heartbeat check cancelled",
        );

        let mut attempt = self.attempt.lock().unwrap();
        attempt.token = self.root_token.child_token();
        attempt.connection = None;
        attempt.pending_exhaust = false;
    }

    /// Derives the next description from a completed probe, publishes it, and decides whether
    /// the inner loop should continue immediately (spec §4.1 steps 5-7).
    async fn on_probe_outcome(self: &Arc<Self>, outcome: ProbeOutcome, previous: Arc<ServerDescription>) -> bool {
        let ProbeOutcome { connection, connection_id, elapsed, result, was_awaited, was_new_connection } = outcome;

        // A reply that was read off the wire successfully can still represent a failure: `{ ok: 0,
        // .. }` is a command error (spec §7), surfaced here as an `Err` so it flows through exactly
        // the same connection-closing/classification path as a network failure below.
        let result: Result<(CommandResponse, HelloCommandResponse)> = match result {
            Ok(response) => match bson::from_document::<HelloCommandResponse>(response.body.clone()) {
                Ok(command_response) if command_response.ok != Some(1.0) => {
                    Err(ErrorKind::Command(CommandError {
                        code: command_response.code.unwrap_or(0),
                        message: command_response
                            .errmsg
                            .unwrap_or_else(|| "command failed".to_string()),
                        topology_version: command_response.topology_version,
                    })
                    .into())
                }
                Ok(command_response) => Ok((response, command_response)),
                Err(e) => {
                    self.listener
                        .on_sdam_information(format!(
                            "could not parse hello reply from {}: {e}",
                            self.server_id.address
                        ))
                        .await;
                    if let Some(handler) = &self.event_handler {
                        handler.handle_sdam_information_event(SdamInformationEvent {
                            server_address: self.server_id.address.clone(),
                            message: e.to_string(),
                        });
                    }
                    Err(Error::internal(e.to_string()))
                }
            },
            Err(e) => Err(e),
        };

        match result {
            Ok((response, command_response)) => {
                if was_new_connection {
                    self.rtt_monitor.add_sample(elapsed);
                }

                let average_rtt = self.rtt_monitor.average().unwrap_or(elapsed);
                let reply = HelloReply { command_response, raw: response.body.clone() };
                let new_description = ServerDescription::from_hello(self.server_id.clone(), &reply, average_rtt);

                {
                    let mut attempt = self.attempt.lock().unwrap();
                    attempt.connection = connection;
                    attempt.pending_exhaust = response.more_to_come;
                }

                self.emit_succeeded(connection_id, elapsed, was_awaited);

                let is_stale = self.topology_clock.as_ref().is_some_and(|clock| {
                    compare_freshness_opt(
                        clock.current_topology_version().as_ref(),
                        new_description.topology_version.as_ref(),
                    ) > 0
                });

                if is_stale {
                    // The topology aggregator already holds a fresher view than this response (an
                    // out-of-order exhaust frame racing a more recent one); keep streaming but
                    // don't let a stale response regress the published description (spec §2, §4.3).
                    return response.more_to_come;
                }

                let continue_immediately = response.more_to_come
                    || (new_description.server_type.is_available() && new_description.topology_version.is_some());

                self.publish(previous, Arc::new(new_description)).await;
                continue_immediately
            }
            Err(e) => {
                let _ = connection;

                // Any network-level failure invalidates the connection outright; a command error
                // reply (server still reachable) is treated the same way here since this minimal
                // transport has no cheaper way to tell the two apart once a read has failed.
                if e.is_network_error() {
                    self.rtt_monitor.reset();
                }

                let continue_immediately = e.is_network_error() && previous.server_type.is_available();

                let new_description = ServerDescription::from_error(self.server_id.clone(), e.clone());

                {
                    let mut attempt = self.attempt.lock().unwrap();
                    attempt.connection = None;
                    attempt.pending_exhaust = false;
                }

                self.emit_failed(connection_id, elapsed, was_awaited, e);

                self.publish(previous, Arc::new(new_description)).await;
                continue_immediately
            }
        }
    }

    async fn publish(&self, old: Arc<ServerDescription>, new: Arc<ServerDescription>) {
        *self.description.lock().unwrap() = new.clone();

        if let Some(handler) = &self.event_handler {
            handler.handle_server_description_changed_event(ServerDescriptionChangedEvent {
                server_address: self.server_id.address.clone(),
                previous_description: (*old).clone(),
                new_description: (*new).clone(),
            });
        }

        let listener = self.listener.clone();
        let old_value = (*old).clone();
        let new_value = (*new).clone();
        let handle = runtime::spawn(async move {
            listener.on_description_changed(old_value, new_value).await;
        });
        // Listener panics are caught by `AsyncJoinHandle` (mapped to a join error) and discarded
        // here so a faulty listener can never break the heartbeat loop (spec §5).
        let _ = handle.await;
    }

    fn emit_started(&self, connection_id: ConnectionId, awaited: bool) {
        if let Some(handler) = &self.event_handler {
            handler.handle_server_heartbeat_started_event(ServerHeartbeatStartedEvent {
                server_address: self.server_id.address.clone(),
                connection_id,
                awaited,
            });
        }
    }

    fn emit_succeeded(&self, connection_id: ConnectionId, duration: Duration, awaited: bool) {
        if let Some(handler) = &self.event_handler {
            handler.handle_server_heartbeat_succeeded_event(ServerHeartbeatSucceededEvent {
                server_address: self.server_id.address.clone(),
                connection_id,
                duration,
                awaited,
            });
        }
    }

    fn emit_failed(&self, connection_id: ConnectionId, duration: Duration, awaited: bool, failure: Error) {
        #[cfg(feature = "tracing-unstable")]
        tracing::warn!(
            target: TRACING_TARGET,
            server_address = %self.server_id.address,
            error = %failure,
            "heartbeat failed",
        );

        if let Some(handler) = &self.event_handler {
            handler.handle_server_heartbeat_failed_event(ServerHeartbeatFailedEvent {
                server_address: self.server_id.address.clone(),
                connection_id,
                duration,
                awaited,
                failure,
            });
        }
    }
}

/// Reported by [`Inner::acquire_probe`]; not itself public API, just the bundle
/// [`Inner::on_probe_outcome`] needs.
struct ProbeOutcome {
    connection: Option<Box<dyn Connection>>,
    connection_id: ConnectionId,
    elapsed: Duration,
    result: Result<CommandResponse>,
    was_awaited: bool,
    was_new_connection: bool,
}

#[cfg(test)]
mod test {
    use bson::{doc, oid::ObjectId};

    use super::*;
    use crate::{
        cmap::test::{MockConnectionFactory, MockReply},
        options::ServerAddress,
        sdam::{ServerState, TopologyVersion},
    };

    #[derive(Default)]
    struct RecordingListener {
        changes: Mutex<Vec<(ServerDescription, ServerDescription)>>,
        sdam_information: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl DescriptionListener for RecordingListener {
        async fn on_description_changed(&self, old: ServerDescription, new: ServerDescription) {
            self.changes.lock().unwrap().push((old, new));
        }

        async fn on_sdam_information(&self, message: String) {
            self.sdam_information.lock().unwrap().push(message);
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        log: Mutex<Vec<&'static str>>,
    }

    impl SdamEventHandler for RecordingEvents {
        fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {
            self.log.lock().unwrap().push("started");
        }

        fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {
            self.log.lock().unwrap().push("succeeded");
        }

        fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {
            self.log.lock().unwrap().push("failed");
        }
    }

    fn server_id() -> ServerId {
        ServerId {
            cluster_id: ObjectId::new(),
            address: ServerAddress::parse("localhost:27017").unwrap(),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn cold_start_handshake_publishes_single_connected_description() {
        let factory = MockConnectionFactory::new(vec![vec![MockReply::Reply {
            body: doc! {
                "ok": 1.0,
                "ismaster": true,
                "minWireVersion": 0,
                "maxWireVersion": 17,
                "maxBsonObjectSize": 16_777_216i64,
                "maxMessageSizeBytes": 48_000_000i64,
                "maxWriteBatchSize": 100_000i64,
            },
            more_to_come: false,
        }]]);

        let listener = Arc::new(RecordingListener::default());
        let events = Arc::new(RecordingEvents::default());
        let settings = ServerMonitoringSettings::builder()
            .heartbeat_interval(Duration::from_secs(60))
            .build();

        let monitor = ServerMonitor::new_with_auth(
            server_id(),
            Arc::new(factory),
            settings,
            listener.clone(),
            Some(events.clone()),
            Arc::new(NoopAuthenticator),
        );
        monitor.initialize();
        settle().await;

        let changes = listener.changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        let (old, new) = &changes[0];
        assert_eq!(old.state, ServerState::Disconnected);
        assert_eq!(new.state, ServerState::Connected);
        assert_eq!(new.server_type, crate::sdam::ServerType::Standalone);
        assert!(new.average_round_trip_time.unwrap() > Duration::ZERO);

        // No ServerHeartbeatStarted event is emitted for the initial handshake itself.
        let log = events.log.lock().unwrap();
        assert_eq!(log.as_slice(), &["succeeded"]);
    }

    #[test]
    fn streaming_command_includes_topology_version_and_max_await_time() {
        let settings = ServerMonitoringSettings::builder()
            .heartbeat_interval(Duration::from_secs(10))
            .build();
        let monitor = ServerMonitor::new(
            server_id(),
            Arc::new(MockConnectionFactory::new(vec![])),
            settings,
            Arc::new(RecordingListener::default()),
        );

        let topology_version = TopologyVersion {
            process_id: ObjectId::new(),
            counter: 0,
        };
        let mut previous = ServerDescription::unknown(server_id());
        previous.server_type = crate::sdam::ServerType::Standalone;
        previous.topology_version = Some(topology_version);

        let command = monitor.inner.build_command(true, &previous);
        assert!(command.contains_key("topologyVersion"));
        assert_eq!(command.get_i64("maxAwaitTimeMS").unwrap(), 10_000);
    }

    #[tokio::test]
    async fn transient_network_error_recovers_within_same_interval() {
        let primary_reply = || MockReply::Reply {
            body: doc! { "ok": 1.0, "ismaster": true, "setName": "rs0", "maxWireVersion": 17 },
            more_to_come: false,
        };

        let factory = MockConnectionFactory::new(vec![
            vec![primary_reply(), MockReply::Err(ErrorKind::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))).into())],
            vec![primary_reply()],
        ]);

        let listener = Arc::new(RecordingListener::default());
        let events = Arc::new(RecordingEvents::default());
        let settings = ServerMonitoringSettings::builder()
            .heartbeat_interval(Duration::from_millis(20))
            .min_heartbeat_interval(Duration::from_millis(1))
            .build();

        let monitor = ServerMonitor::new_with_auth(
            server_id(),
            Arc::new(factory),
            settings,
            listener.clone(),
            Some(events.clone()),
            Arc::new(NoopAuthenticator),
        );
        monitor.initialize();

        // Give the outer loop enough real time to run the handshake, the scheduled re-probe that
        // fails, and the immediate recovery attempt.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let changes = listener.changes.lock().unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].1.server_type, crate::sdam::ServerType::ReplicaSetPrimary);
        assert_eq!(changes[1].1.server_type, crate::sdam::ServerType::Unknown);
        assert!(changes[1].1.last_heartbeat_exception.is_some());
        assert_eq!(changes[2].1.server_type, crate::sdam::ServerType::ReplicaSetPrimary);

        let log = events.log.lock().unwrap();
        let failed_at = log.iter().position(|e| *e == "failed").unwrap();
        let last_succeeded_at = log.iter().rposition(|e| *e == "succeeded").unwrap();
        assert!(failed_at < last_succeeded_at);
    }

    #[tokio::test]
    async fn command_error_reply_publishes_unknown_and_closes_connection() {
        let factory = MockConnectionFactory::new(vec![vec![MockReply::Reply {
            body: doc! {
                "ok": 0.0,
                "errmsg": "not primary",
                "code": 10107i32,
                "topologyVersion": { "processId": ObjectId::new(), "counter": 5i64 },
            },
            more_to_come: false,
        }]]);

        let listener = Arc::new(RecordingListener::default());
        let events = Arc::new(RecordingEvents::default());
        let settings = ServerMonitoringSettings::builder()
            .heartbeat_interval(Duration::from_secs(60))
            .build();

        let monitor = ServerMonitor::new_with_auth(
            server_id(),
            Arc::new(factory),
            settings,
            listener.clone(),
            Some(events.clone()),
            Arc::new(NoopAuthenticator),
        );
        monitor.initialize();
        settle().await;

        let changes = listener.changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        let (_, new) = &changes[0];
        assert_eq!(new.state, ServerState::Disconnected);
        assert_eq!(new.server_type, crate::sdam::ServerType::Unknown);
        assert_eq!(new.topology_version.unwrap().counter, 5);
        let exception = new.last_heartbeat_exception.as_ref().unwrap();
        assert!(exception.is_command_error());

        let log = events.log.lock().unwrap();
        assert_eq!(log.as_slice(), &["failed"]);
    }

    struct FixedTopologyClock(TopologyVersion);

    impl TopologyClock for FixedTopologyClock {
        fn current_topology_version(&self) -> Option<TopologyVersion> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn stale_topology_version_is_not_published() {
        let process_id = ObjectId::new();
        let factory = MockConnectionFactory::new(vec![vec![MockReply::Reply {
            body: doc! {
                "ok": 1.0,
                "ismaster": true,
                "maxWireVersion": 17,
                "topologyVersion": { "processId": process_id, "counter": 3i64 },
            },
            more_to_come: false,
        }]]);

        let listener = Arc::new(RecordingListener::default());
        let events = Arc::new(RecordingEvents::default());
        let settings = ServerMonitoringSettings::builder()
            .heartbeat_interval(Duration::from_secs(60))
            .build();
        let clock = Arc::new(FixedTopologyClock(TopologyVersion { process_id, counter: 7 }));

        let monitor = ServerMonitor::new_full(
            server_id(),
            Arc::new(factory),
            settings,
            listener.clone(),
            Some(events.clone()),
            Arc::new(NoopAuthenticator),
            Some(clock),
        );
        monitor.initialize();
        settle().await;

        // The aggregator's clock already knows counter 7; this response's counter 3 must not
        // regress the published description.
        assert_eq!(listener.changes.lock().unwrap().len(), 0);
        assert_eq!(events.log.lock().unwrap().as_slice(), &["succeeded"]);
    }

    #[tokio::test]
    async fn cancel_current_check_discards_in_flight_streaming_probe() {
        let factory = MockConnectionFactory::new(vec![vec![
            MockReply::Reply {
                body: doc! {
                    "ok": 1.0,
                    "ismaster": true,
                    "topologyVersion": { "processId": ObjectId::new(), "counter": 0i64 },
                    "maxWireVersion": 17,
                },
                more_to_come: false,
            },
            MockReply::Pending,
        ]]);

        let listener = Arc::new(RecordingListener::default());
        let settings = ServerMonitoringSettings::builder()
            .heartbeat_interval(Duration::from_secs(60))
            .build();

        let monitor = ServerMonitor::new(
            server_id(),
            Arc::new(factory),
            settings,
            listener.clone(),
        );
        monitor.initialize();
        settle().await;

        assert_eq!(listener.changes.lock().unwrap().len(), 1);

        monitor.cancel_current_check().unwrap();
        settle().await;

        // The pending second frame never resolves, so cancellation must discard it without
        // producing a second description event.
        assert_eq!(listener.changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_stops_further_events() {
        let factory = MockConnectionFactory::new(vec![vec![MockReply::Pending]]);
        let listener = Arc::new(RecordingListener::default());
        let settings = ServerMonitoringSettings::builder()
            .heartbeat_interval(Duration::from_secs(60))
            .build();

        let monitor = ServerMonitor::new(
            server_id(),
            Arc::new(factory),
            settings,
            listener.clone(),
        );
        monitor.initialize();
        settle().await;

        monitor.dispose();
        monitor.dispose();
        settle().await;

        assert_eq!(listener.changes.lock().unwrap().len(), 0);
        assert!(matches!(
            monitor.request_heartbeat().unwrap_err().kind.as_ref(),
            ErrorKind::Disposed
        ));
    }
}
