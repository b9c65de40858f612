//! The two contracts through which a monitor talks to the surrounding topology aggregator, which
//! this core treats strictly as an external collaborator (spec §1, §2).

use async_trait::async_trait;

use super::{description::ServerDescription, topology_version::TopologyVersion};

/// Consumes description-change notifications from a `ServerMonitor`.
///
/// Calls are strictly serialized per monitor and happen outside the monitor's internal lock, so
/// an implementation that calls back into the monitor (e.g. to read `description()`) cannot
/// deadlock (spec §5, "listener re-entrancy"). Implementations must not panic; a monitor treats a
/// panicking listener the same as any other listener error — caught and discarded.
#[async_trait]
pub trait DescriptionListener: Send + Sync {
    /// Called once per published description, including the very first one after
    /// `initialize()`. `old` equals the `new` of the immediately preceding call for the same
    /// monitor (spec §5, §8).
    async fn on_description_changed(&self, old: ServerDescription, new: ServerDescription);

    /// Called when the heartbeat loop catches an unexpected (bug-like) internal error rather than
    /// a normal probe failure (spec §4.1, §7).
    async fn on_sdam_information(&self, message: String) {
        let _ = message;
    }
}

/// The topology aggregator's view of the freshest `TopologyVersion` it has observed for a server,
/// consulted so a monitor can decide whether a response actually advances freshness (spec §2,
/// §4.3).
pub trait TopologyClock: Send + Sync {
    /// The freshest `TopologyVersion` known to the topology for this server, if any.
    fn current_topology_version(&self) -> Option<TopologyVersion>;
}
