//! Thin constructor binding a connection factory, settings, and listener to freshly minted
//! monitors (spec §4.5).

use std::sync::Arc;

use super::{
    listener::{DescriptionListener, TopologyClock},
    monitor::ServerMonitor,
    ServerId,
};
use crate::{
    auth::{Authenticator, NoopAuthenticator},
    cmap::ConnectionFactory,
    event::sdam::SdamEventHandler,
    options::ServerMonitoringSettings,
};

/// Constructs [`ServerMonitor`]s bound to a shared connection factory, settings, and listener.
///
/// Carries no runtime logic of its own; it exists so a topology aggregator can spin up one
/// monitor per discovered server endpoint without repeating the wiring.
pub struct ServerMonitorFactory {
    connection_factory: Arc<dyn ConnectionFactory>,
    settings: ServerMonitoringSettings,
    listener: Arc<dyn DescriptionListener>,
    event_handler: Option<Arc<dyn SdamEventHandler>>,
    authenticator: Arc<dyn Authenticator>,
    topology_clock: Option<Arc<dyn TopologyClock>>,
}

impl ServerMonitorFactory {
    pub fn new(
        connection_factory: Arc<dyn ConnectionFactory>,
        settings: ServerMonitoringSettings,
        listener: Arc<dyn DescriptionListener>,
    ) -> Self {
        ServerMonitorFactory {
            connection_factory,
            settings,
            listener,
            event_handler: None,
            authenticator: Arc::new(NoopAuthenticator),
            topology_clock: None,
        }
    }

    /// Attaches an [`SdamEventHandler`] that every monitor built from this factory will report
    /// heartbeat and description-change telemetry to.
    pub fn with_event_handler(mut self, event_handler: Arc<dyn SdamEventHandler>) -> Self {
        self.event_handler = Some(event_handler);
        self
    }

    /// Attaches the [`Authenticator`] every monitor built from this factory will use on its
    /// probe connections.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Attaches the [`TopologyClock`] every monitor built from this factory will consult before
    /// adopting a response's `topologyVersion` (spec §2, §4.3).
    pub fn with_topology_clock(mut self, topology_clock: Arc<dyn TopologyClock>) -> Self {
        self.topology_clock = Some(topology_clock);
        self
    }

    /// Builds a new, not-yet-initialized monitor for `server_id`.
    pub fn create_monitor(&self, server_id: ServerId) -> ServerMonitor {
        ServerMonitor::new_full(
            server_id,
            self.connection_factory.clone(),
            self.settings.clone(),
            self.listener.clone(),
            self.event_handler.clone(),
            self.authenticator.clone(),
            self.topology_clock.clone(),
        )
    }
}
