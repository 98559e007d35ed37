//! Typed publish/subscribe engine for Peril.
//!
//! Sits on top of the broker port from `peril-broker` and the codecs from
//! `peril-codec`. Each subscription runs as its own Tokio task that owns a
//! private channel, decodes deliveries, awaits a [`Handler`] and maps the
//! returned [`AckType`] onto ack / nack(requeue) / nack(discard).
//!
//! # Key types
//!
//! - [`PubSub`]: the engine handle; subscribe, declare, publish
//! - [`DurabilityPolicy`]: durable vs transient queues
//! - [`Handler`] / [`AsyncHandler`]: per-message callbacks
//! - [`Subscription`]: state and counters of a running subscription
//! - [`Publisher`]: a dedicated publishing channel with a codec
//! - [`PubSubConfig`]: prefetch, dead-letter exchange, decode policy

mod binder;
mod config;
mod engine;
mod error;
mod handler;
mod publisher;
mod subscriber;

pub use binder::{BoundQueue, DurabilityPolicy};
pub use config::{
    DEFAULT_DEAD_LETTER_EXCHANGE, DEFAULT_DEAD_LETTER_QUEUE, DEFAULT_PREFETCH_COUNT,
    DecodeFailurePolicy, MAX_CONSUMER_TAG_LEN, PubSubConfig, SubscriptionState,
};
pub use engine::PubSub;
pub use error::{PubSubError, SetupStep};
pub use handler::{AckType, AsyncHandler, Handler};
pub use publisher::{Publisher, publish, publish_bincode, publish_json};
pub use subscriber::{Subscription, SubscriptionStats};
