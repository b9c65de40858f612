//! The connection capability the monitor consumes.
//!
//! Spec §1 treats wire framing and command serialization as "assumed available as a `Connection`
//! capability" — this module is that capability's minimal, concrete form: enough OP_MSG-shaped
//! transport (`wire`) to run a `hello`/legacy-hello probe over a real TCP socket, behind the
//! `Connection`/`ConnectionFactory` traits the monitor and RTT loop actually depend on. Swapping
//! the transport (TLS, compression, connection pooling) is purely a matter of supplying a
//! different `ConnectionFactory`.

mod wire;

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bson::Document;
use tokio::net::TcpStream;

use self::wire::WireMessage;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// The driver-generated identifier for a monitoring connection (spec §6,
/// `ServerHeartbeatStartedEvent.connectionId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The result of sending a single probe command: its reply body and whether the server intends
/// to push another frame on this same connection without waiting for a further request (spec
/// §4.1 step 3, "exhaust-allowed").
#[derive(Debug)]
pub struct CommandResponse {
    /// The command's reply document.
    pub body: Document,
    /// Whether the server intends to push another frame on this connection unprompted.
    pub more_to_come: bool,
}

/// A single, already-open channel to a monitored server.
///
/// `ServerMonitor` and `RoundTripTimeMonitor` each own one of these exclusively (spec §3
/// Ownership); there is no connection pooling at this layer. Public so that a
/// [`ConnectionFactory`] implemented outside this crate (TLS, compression, pooling, ...) can
/// return its own connection type.
#[async_trait]
pub trait Connection: Send {
    /// The driver-generated id assigned when this connection was opened.
    fn id(&self) -> ConnectionId;

    /// Sends `command` and waits for its reply. When `exhaust_allowed` is set, the command is
    /// marked to permit the server to keep streaming further frames (spec §6 streaming form).
    async fn command(&mut self, command: Document, exhaust_allowed: bool) -> Result<CommandResponse>;

    /// Reads the next server-pushed frame without sending a new request. Only valid to call
    /// after a prior [`Connection::command`] or [`Connection::receive_more`] reported
    /// `more_to_come`.
    async fn receive_more(&mut self) -> Result<CommandResponse>;
}

/// Opens monitoring connections.
///
/// Injected into [`crate::sdam::monitor::ServerMonitor`] and
/// [`crate::sdam::rtt::RoundTripTimeMonitor`] so neither depends on a concrete transport (spec
/// §4.5, "binds (connectionFactory, serverSettings, eventSink)").
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a new connection to `address`, failing if it is not established within `timeout`.
    async fn connect(
        &self,
        address: &ServerAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// A [`ConnectionFactory`] that opens a plain TCP socket and speaks the minimal OP_MSG framing in
/// [`wire`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectionFactory;

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(
        &self,
        address: &ServerAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let ServerAddress::Tcp { host, port } = address;
        let port = port.unwrap_or(27017);

        let connect = TcpStream::connect((host.as_str(), port));
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out connecting to {address}"),
            ))))??;
        stream.set_nodelay(true)?;

        let id = ConnectionId::next();
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(target: "sdam_core::cmap", %address, connection_id = id.0, "opened monitoring connection");

        Ok(Box::new(TcpConnection {
            id,
            stream,
            next_request_id: AtomicU32::new(1),
        }))
    }
}

struct TcpConnection {
    id: ConnectionId,
    stream: TcpStream,
    next_request_id: AtomicU32,
}

impl TcpConnection {
    fn request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) as i32
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn command(&mut self, command: Document, exhaust_allowed: bool) -> Result<CommandResponse> {
        let request_id = self.request_id();
        WireMessage::command(command, exhaust_allowed)
            .write_to(&mut self.stream, request_id)
            .await?;
        let reply = WireMessage::read_from(&mut self.stream).await?;
        Ok(CommandResponse {
            body: reply.document,
            more_to_come: reply.more_to_come,
        })
    }

    async fn receive_more(&mut self) -> Result<CommandResponse> {
        let reply = WireMessage::read_from(&mut self.stream).await?;
        Ok(CommandResponse {
            body: reply.document,
            more_to_come: reply.more_to_come,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{collections::VecDeque, sync::Mutex};

    use super::*;

    /// A canned reply for [`MockConnection`]: a command success (with its `more_to_come` bit), a
    /// simulated I/O failure, or a read that never completes (used to deterministically win a
    /// race against `cancel_current_check` in tests).
    pub(crate) enum MockReply {
        Reply { body: Document, more_to_come: bool },
        Err(crate::error::Error),
        Pending,
    }

    /// An in-process [`Connection`] that plays back a fixed queue of replies, used by the
    /// `sdam::monitor`/`sdam::rtt` unit tests in place of a real socket.
    pub(crate) struct MockConnection {
        id: ConnectionId,
        replies: Mutex<VecDeque<MockReply>>,
    }

    impl MockConnection {
        pub(crate) fn new(replies: Vec<MockReply>) -> Self {
            Self {
                id: ConnectionId::next(),
                replies: Mutex::new(replies.into()),
            }
        }

        async fn next_reply(&self) -> Result<CommandResponse> {
            let popped = self.replies.lock().unwrap().pop_front();
            match popped {
                Some(MockReply::Reply { body, more_to_come }) => {
                    Ok(CommandResponse { body, more_to_come })
                }
                Some(MockReply::Err(e)) => Err(e),
                Some(MockReply::Pending) => std::future::pending().await,
                None => Err(ErrorKind::Internal {
                    message: "mock connection exhausted".into(),
                }
                .into()),
            }
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn command(&mut self, _command: Document, _exhaust_allowed: bool) -> Result<CommandResponse> {
            self.next_reply().await
        }

        async fn receive_more(&mut self) -> Result<CommandResponse> {
            self.next_reply().await
        }
    }

    /// A [`ConnectionFactory`] that hands out pre-scripted [`MockConnection`]s, one per call to
    /// `connect`, in order.
    pub(crate) struct MockConnectionFactory {
        connections: Mutex<VecDeque<Vec<MockReply>>>,
    }

    impl MockConnectionFactory {
        pub(crate) fn new(connections: Vec<Vec<MockReply>>) -> Self {
            Self {
                connections: Mutex::new(connections.into()),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockConnectionFactory {
        async fn connect(
            &self,
            _address: &ServerAddress,
            _timeout: Duration,
        ) -> Result<Box<dyn Connection>> {
            let replies = self
                .connections
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ErrorKind::Internal {
                    message: "mock connection factory exhausted".into(),
                })?;
            Ok(Box::new(MockConnection::new(replies)))
        }
    }
}
