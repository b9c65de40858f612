//! Contains the `Error` and `Result` types that this crate uses.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::sdam::TopologyVersion;

/// The result type used by this crate's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while monitoring a server. The inner [`ErrorKind`] is wrapped in an
/// `Arc` so that `Error` remains cheaply cloneable, which is required since the same error is
/// both stored on a [`ServerDescription`](crate::sdam::ServerDescription) and emitted on the
/// event channel.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error represents a cancelled operation (root disposal or
    /// `cancel_current_check`), as opposed to a genuine probe failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.kind, ErrorKind::Cancelled)
    }

    /// Whether this is a network-level error (as opposed to a command error reported by the
    /// server). Per spec §7, any such error during a heartbeat counts as a "network error" for
    /// the immediate-retry rule.
    pub fn is_network_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Io(..))
    }

    /// Whether this error represents the server returning `{ ok: 0, .. }` or an equivalent
    /// execution failure.
    pub fn is_command_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Command(_))
    }

    /// Whether a public method was invoked on a monitor that has already been disposed.
    pub fn is_disposed(&self) -> bool {
        matches!(*self.kind, ErrorKind::Disposed)
    }

    /// Extracts the `topologyVersion` a command error reported, if any. Used to adopt a fresher
    /// `TopologyVersion` even from a failed probe, per spec §7.
    pub fn topology_version(&self) -> Option<TopologyVersion> {
        match &*self.kind {
            ErrorKind::Command(c) => c.topology_version,
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        ErrorKind::InvalidResponse {
            message: err.to_string(),
        }
        .into()
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        ErrorKind::InvalidResponse {
            message: err.to_string(),
        }
        .into()
    }
}

/// The kinds of errors this crate's operations can produce.
///
/// This is a deliberately small subset of the kinds a full driver carries: everything that does
/// not bear on monitoring a single server (write failures, transaction errors, encryption, etc.)
/// is out of scope, per spec §1/§7.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The operation did not complete because the underlying probe was cancelled, either because
    /// the monitor was disposed or because `cancel_current_check` fired mid-probe. This must
    /// never surface as a description change (spec §7).
    #[error("operation was cancelled")]
    Cancelled,

    /// A method was invoked on a monitor that had not yet called `initialize`.
    #[error("monitor has not been initialized")]
    NotInitialized,

    /// A method was invoked on a monitor that has already been disposed.
    #[error("monitor has been disposed")]
    Disposed,

    /// Wrapper around [`std::io::Error`]; covers connection establishment and read/write
    /// failures. Treated as a network error for SDAM purposes.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server replied with `{ ok: 0, .. }` or an equivalent execution failure.
    #[error("command failed: {0}")]
    Command(CommandError),

    /// The server returned a reply this crate could not interpret.
    #[error("invalid server reply: {message}")]
    InvalidResponse { message: String },

    /// An invalid argument was provided to a public API.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An unexpected (bug-like) internal error. Per spec §4.1, these are reported through
    /// `SdamInformationEvent` rather than being allowed to crash the monitoring loop.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// An error reported by the server in response to a probe command.
#[derive(Clone, Debug)]
pub struct CommandError {
    /// The numeric error code the server returned.
    pub code: i32,

    /// A human-readable description of the failure.
    pub message: String,

    /// The `topologyVersion` the server included in the error reply, if any.
    pub topology_version: Option<TopologyVersion>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(code {}) {}", self.code, self.message)
    }
}
