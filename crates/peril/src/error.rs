//! Unified error type for Peril.

use peril_broker::BrokerError;
use peril_codec::CodecError;
use peril_pubsub::PubSubError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum PerilError {
    /// A broker-level error (connection, channel, declare).
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A codec error outside the pub/sub engine.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A subscribe or publish error.
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}
