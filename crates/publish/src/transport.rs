//! Transport abstraction for message bus publishing

use std::time::Duration;

use async_trait::async_trait;

/// Errors raised by a transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No endpoint is configured
    #[error("no broker endpoints configured")]
    NoEndpoints,

    /// Connecting to an endpoint failed
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Publishing on an open connection failed
    #[error("publish failed: {0}")]
    Publish(String),

    /// The connection is no longer usable
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Closing the connection failed
    #[error("close failed: {0}")]
    Close(String),
}

/// Opens connections to a broker
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection type produced by this transport
    type Connection: Connection;

    /// Connect to one endpoint
    async fn connect(&self, endpoint: &str) -> Result<Self::Connection, TransportError>;
}

/// An open broker connection
#[async_trait]
pub trait Connection: Send + 'static {
    /// Publish one message
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError>;

    /// Wait at most `wait` for a heartbeat from the broker
    ///
    /// Returns `Ok(true)` when one was received.
    async fn poll_heartbeat(&mut self, wait: Duration) -> Result<bool, TransportError>;

    /// Heartbeat interval negotiated with the broker
    fn heartbeat_interval(&self) -> Option<Duration>;

    /// Close the connection
    async fn close(self) -> Result<(), TransportError>;
}
