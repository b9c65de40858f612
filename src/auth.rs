//! The pluggable authentication seam.
//!
//! Per spec §1, SASL and AWS-SIG-V4 handshakes are deliberately out of scope for this core: it
//! only defines the contract a connection factory invokes once per connection open. A concrete
//! driver embeds this crate and supplies its own [`Authenticator`] implementation; this crate
//! ships only the trait and a no-op default used when no credentials are configured.

use async_trait::async_trait;
use bson::Document;

use crate::error::Result;

/// Performs (or skips) authentication on a freshly opened monitoring connection.
///
/// Implementations may piggyback a `speculativeAuthenticate` document onto the initial
/// handshake command (spec §6) and finish the conversation once the handshake reply comes back;
/// this core never inspects the contents of that exchange beyond passing the document through.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the document, if any, that should be attached as `speculativeAuthenticate` on the
    /// initial handshake command.
    fn speculative_authenticate_document(&self) -> Option<Document> {
        None
    }

    /// Completes authentication using the handshake reply's `speculativeAuthenticate` sub-reply,
    /// if present. A connection-level network failure during this exchange must be surfaced as
    /// [`crate::error::ErrorKind::Io`] so the monitor treats it like any other network error
    /// (spec §7).
    async fn authenticate(&self, speculative_reply: Option<&Document>) -> Result<()> {
        let _ = speculative_reply;
        Ok(())
    }
}

/// An [`Authenticator`] that never attempts to authenticate. Used when a deployment requires no
/// credentials, or as the default for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {}
