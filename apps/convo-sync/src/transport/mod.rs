use async_trait::async_trait;
use broker_proto::ProtoError;
use std::time::Duration;
use thiserror::Error;

pub mod connection;
pub mod mock;
pub mod websocket;

pub use connection::{Connection, ConnectionConfig, FrameReceiver};
pub use mock::MockBroker;
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to reach {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("link closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("connection stopped")]
    Stopped,
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("no inbound traffic for {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("broker rejected the session: {0}")]
    Rejected(String),
    #[error("broker reported an error: {0}")]
    Broker(String),
    #[error("websocket failure: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

/// A duplex text pipe to the broker. One link lives for one session; a
/// reconnect opens a fresh one through the [`Connector`].
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// `None` once the peer has gone away.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn Link>, TransportError>;

    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot published on the connection's watch channel.
///
/// `session` increments every time a handshake completes, so observers can
/// tell a fresh session apart from the one they already saw even if they
/// missed the disconnected state in between. `stopped` is set by an explicit
/// [`Connection::disconnect`] and cleared by the next `connect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub session: u64,
    pub attempts: u32,
    pub stopped: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Exponential reconnect delay: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}
