//! Broker abstraction layer for Peril.
//!
//! Provides the [`Broker`], [`BrokerChannel`] and [`Delivery`] traits that
//! isolate every broker-specific call (open channel, declare, bind, qos,
//! consume, publish, ack, nack) behind a narrow port. The pub/sub engine is
//! written against these traits only, so it runs unchanged on a live AMQP
//! broker or on the in-memory fake used by tests.
//!
//! # Feature Flags
//!
//! - `amqp` (default): AMQP 0-9-1 implementation via `lapin`
//! - `memory` (default): in-process fake broker

mod error;
mod topic;

#[cfg(feature = "amqp")]
mod amqp;
#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpChannel, AmqpDelivery};
pub use error::BrokerError;
#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnection, MemoryDelivery, QueueStats};
pub use topic::topic_matches;

use std::fmt;

use futures_util::stream::BoxStream;

/// Queue argument carrying the dead-letter exchange name.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// A stream of deliveries from one consumer.
///
/// Ends (`None`) when the owning channel or connection closes.
pub type DeliveryStream<D> = BoxStream<'static, Result<D, BrokerError>>;

/// The flags a queue is declared with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueueFlags {
    /// Survives a broker restart.
    pub durable: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
    /// Usable only by the connection that declared it.
    pub exclusive: bool,
}

/// Optional queue arguments understood by the port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// Exchange that receives messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

impl QueueArguments {
    /// Arguments routing discarded messages to `exchange`.
    pub fn dead_letter(exchange: impl Into<String>) -> Self {
        Self {
            dead_letter_exchange: Some(exchange.into()),
        }
    }
}

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Binding key is a dot-separated pattern with `*` and `#` wildcards.
    Topic,
    /// Every bound queue gets a copy; keys are ignored.
    Fanout,
}

impl ExchangeKind {
    /// The AMQP name of this exchange type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }

    /// Whether a message published with `routing_key` reaches a queue
    /// bound under `binding_key`.
    pub fn routes(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Direct => binding_key == routing_key,
            Self::Topic => topic_matches(binding_key, routing_key),
            Self::Fanout => true,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message about to be published.
///
/// Published as non-mandatory and non-immediate: unroutable messages
/// are dropped by the broker rather than returned.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    /// Encoded payload.
    pub body: &'a [u8],
    /// Value of the `content-type` property.
    pub content_type: &'a str,
}

/// A connection to a broker, shared process-wide.
///
/// Implementations must allow channels to be opened concurrently from
/// many tasks.
pub trait Broker: Send + Sync + 'static {
    /// The channel type produced by this broker.
    type Channel: BrokerChannel;

    /// Opens a new channel on this connection.
    fn open_channel(
        &self,
    ) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;

    /// Closes the connection and every channel opened on it.
    ///
    /// Consumption streams end; unacknowledged deliveries go back to
    /// their queues.
    fn close(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// A single channel. Not meant to be shared between concurrent writers.
pub trait BrokerChannel: Send + Sync + 'static {
    /// The delivery type yielded by [`consume`](Self::consume).
    type Delivery: Delivery;

    /// Declares an exchange. Re-declaring with identical settings is a no-op.
    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Declares a queue and returns its name.
    ///
    /// An empty `name` asks the broker to generate one. Re-declaring an
    /// existing queue with identical flags and arguments is a no-op.
    fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        args: &QueueArguments,
    ) -> impl Future<Output = Result<String, BrokerError>> + Send;

    /// Binds `queue` to `exchange` under `routing_key`. Idempotent.
    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Limits unacknowledged deliveries per consumer created afterwards.
    fn set_prefetch(
        &self,
        count: u16,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Starts a manual-ack consumer on `queue`.
    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> impl Future<Output = Result<DeliveryStream<Self::Delivery>, BrokerError>> + Send;

    /// Publishes a message to `exchange` under `routing_key`.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage<'_>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Closes the channel.
    fn close(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// An in-flight message.
///
/// `ack` and `nack` take `self`, so a delivery is settled at most once.
pub trait Delivery: Send + 'static {
    /// The raw message body.
    fn body(&self) -> &[u8];

    /// Channel-scoped identifier assigned by the broker.
    fn delivery_tag(&self) -> u64;

    /// Routing key the message was published with.
    fn routing_key(&self) -> &str;

    /// Whether the broker delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledges the delivery.
    fn ack(self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Rejects the delivery. With `requeue` the broker redelivers it,
    /// otherwise it goes to the queue's dead-letter exchange (if any).
    fn nack(self, requeue: bool) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_names() {
        assert_eq!(ExchangeKind::Direct.as_str(), "direct");
        assert_eq!(ExchangeKind::Topic.to_string(), "topic");
        assert_eq!(ExchangeKind::Fanout.as_str(), "fanout");
    }

    #[test]
    fn test_direct_routes_exact_key_only() {
        assert!(ExchangeKind::Direct.routes("pause", "pause"));
        assert!(!ExchangeKind::Direct.routes("pause", "pause.alice"));
        assert!(!ExchangeKind::Direct.routes("army_moves.*", "army_moves.alice"));
    }

    #[test]
    fn test_topic_routes_wildcards() {
        assert!(ExchangeKind::Topic.routes("army_moves.*", "army_moves.alice"));
        assert!(!ExchangeKind::Topic.routes("army_moves.*", "war.alice"));
    }

    #[test]
    fn test_fanout_ignores_keys() {
        assert!(ExchangeKind::Fanout.routes("", "anything.at.all"));
    }

    #[test]
    fn test_dead_letter_arguments() {
        let args = QueueArguments::dead_letter("peril_dlx");
        assert_eq!(args.dead_letter_exchange.as_deref(), Some("peril_dlx"));
        assert_eq!(QueueArguments::default().dead_letter_exchange, None);
    }
}
