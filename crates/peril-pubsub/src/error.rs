//! Error types for the pub/sub engine.

use std::fmt;

use peril_broker::BrokerError;
use peril_codec::CodecError;

use crate::AckType;

/// The subscription setup step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    OpenChannel,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    SetPrefetch,
    Consume,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Self::OpenChannel => "create channel",
            Self::DeclareExchange => "declare exchange",
            Self::DeclareQueue => "declare queue",
            Self::BindQueue => "bind queue",
            Self::SetPrefetch => "set channel prefetch count",
            Self::Consume => "start consuming",
        };
        f.write_str(step)
    }
}

/// Errors surfaced by the pub/sub engine.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// Queue setup failed. Not retried; the subscription never started.
    #[error("couldn't {step}: {source}")]
    Connection {
        step: SetupStep,
        #[source]
        source: BrokerError,
    },

    /// The value couldn't be encoded. Nothing was sent.
    #[error(transparent)]
    Encode(CodecError),

    /// A delivery body couldn't be decoded.
    #[error(transparent)]
    Decode(CodecError),

    /// The broker refused or failed the publish. Not retried.
    #[error("couldn't publish to exchange '{exchange}' with key '{routing_key}': {source}")]
    Publish {
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    /// The ack/nack call itself failed, e.g. on a closed channel.
    #[error("couldn't {ack} delivery {delivery_tag}: {source}")]
    Ack {
        delivery_tag: u64,
        ack: AckType,
        #[source]
        source: BrokerError,
    },
}

impl PubSubError {
    pub(crate) fn setup(step: SetupStep) -> impl FnOnce(BrokerError) -> Self {
        move |source| Self::Connection { step, source }
    }

    /// The failed setup step, for [`PubSubError::Connection`].
    pub fn setup_step(&self) -> Option<SetupStep> {
        match self {
            Self::Connection { step, .. } => Some(*step),
            _ => None,
        }
    }
}
