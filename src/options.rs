//! Configuration surface for the monitoring core: server addresses and the settings that
//! govern heartbeat pacing, connect/heartbeat timeouts.

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{Error, ErrorKind, Result};

/// The default interval between heartbeats (spec §6).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// The minimum interval enforced between the start of one heartbeat and the next, even when
/// `request_heartbeat` is used to wake the scheduler early (spec §4.1).
pub const DEFAULT_MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// The address of a monitored server.
///
/// Endpoints are value-equal by string form: hostnames are lowercased and a missing port is
/// treated as the default port for equality/hashing purposes (spec §3).
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the server can be found.
        host: String,

        /// The TCP port the server is listening on. Defaults to 27017 when absent.
        port: Option<u16>,
    },
}

impl ServerAddress {
    /// Parses an address string of the form `host` or `host:port`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{address}\""),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port: u16 = part.parse().map_err(|_| ErrorKind::InvalidArgument {
                    message: format!("invalid port in address \"{address}\""),
                })?;
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("address \"{address}\" has more than one ':'"),
                    }
                    .into());
                }
                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    fn normalized_port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(27017),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{}", port.unwrap_or(27017)),
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Tcp { host, .. }, Self::Tcp { host: other_host, .. }) => {
                host == other_host && self.normalized_port() == other.normalized_port()
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Tcp { host, .. } => {
                host.hash(state);
                self.normalized_port().hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The identity of the topology a server belongs to, used together with a `ServerAddress` to
/// form a `ServerId` (spec §3).
pub type ClusterId = bson::oid::ObjectId;

/// Settings that govern how a `ServerMonitor` paces and times its probes.
///
/// All fields are immutable once constructed (spec §6): there is no runtime mutation of a live
/// monitor's settings.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ServerMonitoringSettings {
    /// The interval between heartbeats when the server is healthy and not streaming.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL)]
    pub heartbeat_interval: Duration,

    /// The minimum time that must elapse between the start of consecutive heartbeats, even when
    /// woken early via `request_heartbeat`.
    #[builder(default = DEFAULT_MIN_HEARTBEAT_INTERVAL)]
    pub min_heartbeat_interval: Duration,

    /// The maximum time to wait when opening a monitoring connection.
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    /// The maximum time to wait for a single heartbeat's reply (polling or streaming).
    #[builder(default = Duration::from_secs(10))]
    pub heartbeat_timeout: Duration,
}

impl Default for ServerMonitoringSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}
