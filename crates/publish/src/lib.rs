// Clusterfacts Publishing
//
// Delivery of rendered items to files, HTTP endpoints and a message bus.
// Transport failures never escalate: a publish is retried once over a
// fresh connection and then dropped with an error log.

pub mod bus;
pub mod channel;
pub mod sink;
pub mod transport;

pub use bus::{RedisConnection, RedisTransport};
pub use channel::{
    ChannelConfig, CloseOutcome, PublishChannel, PublishOutcome, MAX_PUBLISH_ATTEMPTS,
};
pub use sink::{FileSink, HttpMethod, HttpSink, SinkError, WriteMode};
pub use transport::{Connection, Transport, TransportError};
