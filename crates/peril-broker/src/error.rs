/// Errors that can occur in the broker layer.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was closed, by us or by the broker.
    #[error("channel closed")]
    ChannelClosed,

    /// An exchange or queue does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The entity exists with different settings.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An exclusive queue is owned by another connection.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// The delivery is no longer outstanding on its channel.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// Error reported by the AMQP client.
    #[cfg(feature = "amqp")]
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

impl BrokerError {
    pub(crate) fn exchange_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "exchange",
            name: name.to_string(),
        }
    }

    pub(crate) fn queue_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "queue",
            name: name.to_string(),
        }
    }
}
