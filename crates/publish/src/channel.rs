//! Resilient publish channel
//!
//! The `PublishChannel` is responsible for:
//! - Picking a random endpoint first and rotating through the rest on
//!   reconnect
//! - Retrying a failed publish exactly once over a fresh connection
//! - Treating a connection without heartbeats as dead, also while idle
//!   between items
//! - Closing connections on a separate task with a bounded wait

use std::future::Future;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::transport::{Connection, Transport, TransportError};

/// Attempts per item: the first send plus one retry after reconnecting
pub const MAX_PUBLISH_ATTEMPTS: u32 = 2;

/// Configuration for a publish channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Exchange messages are published to
    pub exchange: String,

    /// Heartbeat interval used when the transport does not negotiate one
    pub heartbeat_interval: Option<Duration>,

    /// How long each heartbeat check may wait
    pub heartbeat_wait: Duration,

    /// Upper bound on waiting for a connection to close
    pub close_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            exchange: "clusterfacts".to_string(),
            heartbeat_interval: None,
            heartbeat_wait: Duration::from_millis(100),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    /// Create a configuration for an exchange
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..Default::default()
        }
    }

    /// Set the fallback heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Set the heartbeat wait
    pub fn with_heartbeat_wait(mut self, wait: Duration) -> Self {
        self.heartbeat_wait = wait;
        self
    }

    /// Set the close timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Result of publishing one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent; `attempts` is 1 or 2
    Delivered { attempts: u32 },

    /// Given up on after the last attempt
    Dropped { error: String },
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered { .. })
    }
}

/// Result of closing a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// No connection was open, or it closed cleanly
    Clean,

    /// The transport reported an error while closing
    Failed(String),

    /// Closing did not finish within the bound and was abandoned
    TimedOut,
}

/// Publishes to a broker over a transport, surviving broker failures
pub struct PublishChannel<T: Transport> {
    transport: T,
    endpoints: Vec<String>,
    next_endpoint: usize,
    config: ChannelConfig,
    connection: Option<T::Connection>,
    last_heartbeat: Instant,
    dropped: u64,
}

impl<T: Transport> PublishChannel<T> {
    /// Create a channel; no connection is made until the first publish
    pub fn new(
        transport: T,
        endpoints: impl IntoIterator<Item = impl Into<String>>,
        config: ChannelConfig,
    ) -> Result<Self, TransportError> {
        let mut endpoints: Vec<String> = endpoints.into_iter().map(Into::into).collect();
        if endpoints.is_empty() {
            return Err(TransportError::NoEndpoints);
        }
        let mut rng = rand::thread_rng();
        endpoints.shuffle(&mut rng);
        let next_endpoint = rng.gen_range(0..endpoints.len());

        Ok(Self {
            transport,
            endpoints,
            next_endpoint,
            config,
            connection: None,
            last_heartbeat: Instant::now(),
            dropped: 0,
        })
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Endpoints in the order they are tried
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Items given up on since the channel was created
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Publish one message
    ///
    /// On failure the connection is closed, a new one is opened and the
    /// send is retried once. A second failure drops the item.
    #[instrument(skip(self, body), fields(exchange = %self.config.exchange))]
    pub async fn publish(&mut self, routing_key: &str, body: &[u8]) -> PublishOutcome {
        self.service_heartbeats().await;

        let mut last_error = String::new();
        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            if self.connection.is_none() {
                if let Err(e) = self.connect().await {
                    warn!(attempt, error = %e, "No broker connection");
                    last_error = e.to_string();
                    continue;
                }
            }
            let Some(connection) = self.connection.as_mut() else {
                continue;
            };

            match connection
                .publish(&self.config.exchange, routing_key, body)
                .await
            {
                Ok(()) => {
                    debug!(attempt, "Published");
                    return PublishOutcome::Delivered { attempts: attempt };
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Publish failed, dropping connection");
                    last_error = e.to_string();
                    self.close().await;
                }
            }
        }

        self.dropped += 1;
        error!(
            error = %last_error,
            attempts = MAX_PUBLISH_ATTEMPTS,
            dropped = self.dropped,
            "Dropping item"
        );
        PublishOutcome::Dropped { error: last_error }
    }

    /// Wait for `next` while keeping heartbeats serviced
    ///
    /// Publishers block here between items. Heartbeats are checked every
    /// `heartbeat_wait`, so a dead connection is closed even when nothing
    /// is being sent.
    pub async fn idle_until<F: Future>(&mut self, next: F) -> F::Output {
        tokio::pin!(next);
        loop {
            tokio::select! {
                biased;
                output = &mut next => return output,
                _ = tokio::time::sleep(self.config.heartbeat_wait) => {
                    self.service_heartbeats().await;
                }
            }
        }
    }

    /// Check for a heartbeat without blocking for long
    ///
    /// A connection that has not shown a heartbeat for longer than its
    /// interval is closed; the next publish reconnects.
    pub async fn service_heartbeats(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        match connection.poll_heartbeat(self.config.heartbeat_wait).await {
            Ok(true) => self.last_heartbeat = Instant::now(),
            Ok(false) => {
                let interval = connection
                    .heartbeat_interval()
                    .or(self.config.heartbeat_interval);
                if let Some(interval) = interval {
                    let silent = self.last_heartbeat.elapsed();
                    if silent > interval {
                        warn!(silent_ms = silent.as_millis() as u64, "Missed heartbeats, closing connection");
                        self.close().await;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat failed, closing connection");
                self.close().await;
            }
        }
    }

    /// Close the current connection, waiting at most the close timeout
    ///
    /// The close runs on its own task; if it does not finish in time the
    /// task is left behind and control returns to the caller.
    pub async fn close(&mut self) -> CloseOutcome {
        let Some(connection) = self.connection.take() else {
            return CloseOutcome::Clean;
        };

        let handle = tokio::spawn(connection.close());
        match tokio::time::timeout(self.config.close_timeout, handle).await {
            Ok(Ok(Ok(()))) => CloseOutcome::Clean,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Connection close failed");
                CloseOutcome::Failed(e.to_string())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Connection close task failed");
                CloseOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.close_timeout.as_millis() as u64,
                    "Connection close timed out, abandoning it"
                );
                CloseOutcome::TimedOut
            }
        }
    }

    /// Connect to the next endpoint that accepts, trying each at most once
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut last_error = TransportError::NoEndpoints;
        for _ in 0..self.endpoints.len() {
            let endpoint = &self.endpoints[self.next_endpoint];
            self.next_endpoint = (self.next_endpoint + 1) % self.endpoints.len();

            match self.transport.connect(endpoint).await {
                Ok(connection) => {
                    info!(%endpoint, "Connected to broker");
                    self.connection = Some(connection);
                    self.last_heartbeat = Instant::now();
                    return Ok(());
                }
                Err(e) => {
                    warn!(%endpoint, error = %e, "Connect failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counters {
        connects: Mutex<Vec<String>>,
        sends: AtomicUsize,
        closes: AtomicUsize,
    }

    #[derive(Clone, Copy, Default)]
    struct Behaviour {
        refuse_connect: bool,
        fail_publish: bool,
        hang_on_close: bool,
        heartbeat: bool,
    }

    struct MockTransport {
        counters: Arc<Counters>,
        behaviour: Behaviour,
    }

    struct MockConnection {
        counters: Arc<Counters>,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Connection = MockConnection;

        async fn connect(&self, endpoint: &str) -> Result<MockConnection, TransportError> {
            self.counters.connects.lock().unwrap().push(endpoint.to_string());
            if self.behaviour.refuse_connect {
                return Err(TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: "refused".to_string(),
                });
            }
            Ok(MockConnection {
                counters: self.counters.clone(),
                behaviour: self.behaviour,
            })
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn publish(&mut self, _: &str, _: &str, _: &[u8]) -> Result<(), TransportError> {
            self.counters.sends.fetch_add(1, Ordering::SeqCst);
            if self.behaviour.fail_publish {
                return Err(TransportError::Publish("broker unreachable".to_string()));
            }
            Ok(())
        }

        async fn poll_heartbeat(&mut self, wait: Duration) -> Result<bool, TransportError> {
            if self.behaviour.heartbeat {
                return Ok(true);
            }
            tokio::time::sleep(wait).await;
            Ok(false)
        }

        fn heartbeat_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }

        async fn close(self) -> Result<(), TransportError> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            if self.behaviour.hang_on_close {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn channel(behaviour: Behaviour) -> (PublishChannel<MockTransport>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let transport = MockTransport {
            counters: counters.clone(),
            behaviour,
        };
        let channel = PublishChannel::new(
            transport,
            ["amqp://a", "amqp://b", "amqp://c"],
            ChannelConfig::new("facts"),
        )
        .unwrap();
        (channel, counters)
    }

    #[tokio::test]
    async fn test_publish_delivers_on_first_attempt() {
        let (mut channel, counters) = channel(Behaviour {
            heartbeat: true,
            ..Default::default()
        });

        let outcome = channel.publish("node-17", b"{}").await;
        assert_eq!(outcome, PublishOutcome::Delivered { attempts: 1 });
        assert_eq!(counters.sends.load(Ordering::SeqCst), 1);
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_drop_the_item() {
        let (mut channel, counters) = channel(Behaviour {
            fail_publish: true,
            hang_on_close: true,
            heartbeat: true,
            ..Default::default()
        });

        let outcome = channel.publish("node-17", b"{}").await;

        assert!(matches!(outcome, PublishOutcome::Dropped { .. }));
        assert_eq!(counters.sends.load(Ordering::SeqCst), 2);
        assert_eq!(counters.connects.lock().unwrap().len(), 2);
        assert!(!channel.is_connected());
        assert_eq!(channel.dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_items_are_not_counted_as_dropped() {
        let (mut channel, _) = channel(Behaviour {
            heartbeat: true,
            ..Default::default()
        });

        for key in ["a", "b", "c"] {
            assert!(channel.publish(key, b"{}").await.is_delivered());
        }
        assert_eq!(channel.dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_close_returns_within_bound() {
        let (mut channel, counters) = channel(Behaviour {
            hang_on_close: true,
            heartbeat: true,
            ..Default::default()
        });
        channel.publish("x", b"1").await;

        let started = Instant::now();
        let outcome = channel.close().await;
        let waited = started.elapsed();

        assert_eq!(outcome, CloseOutcome::TimedOut);
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_millis(5100));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(!channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_close_connection() {
        let (mut channel, counters) = channel(Behaviour::default());
        channel.publish("x", b"1").await;
        assert!(channel.is_connected());

        tokio::time::advance(Duration::from_secs(2)).await;
        channel.service_heartbeats().await;

        assert!(!channel.is_connected());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_closed_without_items() {
        let (mut channel, counters) = channel(Behaviour::default());
        channel.publish("x", b"1").await;
        assert!(channel.is_connected());

        // No further item for three heartbeat intervals
        channel.idle_until(tokio::time::sleep(Duration::from_secs(3))).await;

        assert!(!channel.is_connected());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_kept_while_heartbeats_arrive() {
        let (mut channel, counters) = channel(Behaviour {
            heartbeat: true,
            ..Default::default()
        });
        channel.publish("x", b"1").await;

        let next = channel
            .idle_until(async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "next item"
            })
            .await;

        assert_eq!(next, "next item");
        assert!(channel.is_connected());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnects_rotate_through_endpoints() {
        let (mut channel, counters) = channel(Behaviour {
            refuse_connect: true,
            ..Default::default()
        });

        let outcome = channel.publish("x", b"1").await;
        assert!(matches!(outcome, PublishOutcome::Dropped { .. }));
        assert_eq!(counters.sends.load(Ordering::SeqCst), 0);

        let tried = counters.connects.lock().unwrap().clone();
        assert_eq!(tried.len(), 6);
        let start = channel
            .endpoints()
            .iter()
            .position(|e| *e == tried[0])
            .unwrap();
        for (n, endpoint) in tried.iter().enumerate() {
            assert_eq!(*endpoint, channel.endpoints()[(start + n) % 3]);
        }
    }

    #[test]
    fn test_no_endpoints_rejected() {
        let transport = MockTransport {
            counters: Arc::default(),
            behaviour: Behaviour::default(),
        };
        let result = PublishChannel::new(transport, Vec::<String>::new(), ChannelConfig::default());
        assert!(matches!(result, Err(TransportError::NoEndpoints)));
    }
}
