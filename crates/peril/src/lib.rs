//! # Peril
//!
//! Typed publish/subscribe over an AMQP broker for the Peril game.
//!
//! This crate ties the layers together: codecs (`peril-codec`), the
//! broker port (`peril-broker`) and the subscription engine
//! (`peril-pubsub`). Binaries open one [`PerilConnection`], declare the
//! game topology, then subscribe and publish through
//! [`PerilConnection::pubsub`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peril::prelude::*;
//! use peril::routing::{self, PlayingState};
//!
//! # async fn run() -> Result<(), PerilError> {
//! let connection = PerilConnection::connect(&ConnectionConfig::from_env()).await?;
//! connection.declare_game_topology().await?;
//!
//! let queue = routing::key(routing::PAUSE_KEY, "alice");
//! let subscription = connection
//!     .pubsub()
//!     .subscribe_json(
//!         routing::EXCHANGE_PERIL_DIRECT,
//!         &queue,
//!         routing::PAUSE_KEY,
//!         DurabilityPolicy::Transient,
//!         |state: PlayingState| {
//!             println!("paused: {}", state.is_paused);
//!             AckType::Ack
//!         },
//!     )
//!     .await?;
//!
//! connection.close().await?;
//! subscription.stopped().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `amqp` (default): [`PerilConnection::connect`] over a live broker.
//!   Without it only the in-memory broker (`broker::MemoryBroker`) is built.

mod connection;
mod error;
mod logging;
pub mod routing;

pub use connection::{
    AMQP_URL_ENV, ConnectionConfig, DEFAULT_AMQP_URL, GAME_EXCHANGES, PerilConnection,
};
pub use error::PerilError;
pub use logging::{DEFAULT_LOG_FILTER, init_tracing};

pub use peril_broker as broker;
pub use peril_codec as codec;
pub use peril_pubsub as pubsub;

/// Commonly used types, re-exported for convenience.
///
/// ```rust
/// use peril::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{ConnectionConfig, PerilConnection, PerilError};
    pub use peril_broker::{Broker, BrokerChannel, ExchangeKind};
    pub use peril_codec::{BincodeCodec, Codec, JsonCodec};
    pub use peril_pubsub::{
        AckType, AsyncHandler, DecodeFailurePolicy, DurabilityPolicy, Handler, PubSub,
        PubSubConfig, PubSubError, Publisher, Subscription, SubscriptionState, publish,
        publish_bincode, publish_json,
    };
}
