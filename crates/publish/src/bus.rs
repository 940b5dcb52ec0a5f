// Redis message bus transport
//
// An exchange plus routing key maps onto the Redis channel
// "<exchange>.<routing_key>". Liveness is checked with PING, sent at half
// the heartbeat interval.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::{Connection, Transport, TransportError};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connects to Redis endpoints such as `redis://broker-1:6379`
#[derive(Debug, Clone)]
pub struct RedisTransport {
    heartbeat_interval: Duration,
}

impl Default for RedisTransport {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl RedisTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval used for new connections
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[async_trait]
impl Transport for RedisTransport {
    type Connection = RedisConnection;

    async fn connect(&self, endpoint: &str) -> Result<RedisConnection, TransportError> {
        let connect_error = |e: redis::RedisError| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        };
        let client = redis::Client::open(endpoint).map_err(connect_error)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connect_error)?;

        Ok(RedisConnection {
            connection,
            heartbeat_interval: self.heartbeat_interval,
            last_ping: Instant::now(),
        })
    }
}

fn ping_due(last_ping: Instant, heartbeat_interval: Duration) -> bool {
    last_ping.elapsed() >= heartbeat_interval / 2
}

/// An open Redis connection
pub struct RedisConnection {
    connection: MultiplexedConnection,
    heartbeat_interval: Duration,
    last_ping: Instant,
}

#[async_trait]
impl Connection for RedisConnection {
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError> {
        let channel = format!("{exchange}.{routing_key}");
        let receivers = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(body)
            .query_async::<i64>(&mut self.connection)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        debug!(%channel, receivers, "Published to bus");
        Ok(())
    }

    async fn poll_heartbeat(&mut self, wait: Duration) -> Result<bool, TransportError> {
        if !ping_due(self.last_ping, self.heartbeat_interval) {
            return Ok(false);
        }
        self.last_ping = Instant::now();

        let cmd = redis::cmd("PING");
        let ping = cmd.query_async::<String>(&mut self.connection);
        match tokio::time::timeout(wait, ping).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(TransportError::ConnectionLost(e.to_string())),
            Err(_) => Ok(false),
        }
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        Some(self.heartbeat_interval)
    }

    async fn close(self) -> Result<(), TransportError> {
        // The multiplexed driver shuts down once its last handle is dropped
        drop(self.connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_endpoint_is_connect_error() {
        let transport = RedisTransport::new();
        let result = transport.connect("not a url").await;
        assert!(matches!(
            result,
            Err(TransportError::Connect { endpoint, .. }) if endpoint == "not a url"
        ));
    }

    #[tokio::test]
    async fn test_refused_endpoint_is_connect_error() {
        let transport = RedisTransport::new().with_heartbeat_interval(Duration::from_secs(5));
        let result = transport.connect("redis://127.0.0.1:1").await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sent_at_half_interval() {
        let interval = Duration::from_secs(30);
        let last_ping = Instant::now();
        assert!(!ping_due(last_ping, interval));

        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(!ping_due(last_ping, interval));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ping_due(last_ping, interval));
    }
}
