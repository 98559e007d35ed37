//! Handler abstraction and acknowledgment decisions.

use std::fmt;

/// A handler's decision about a decoded delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Processed; remove from the queue.
    Ack,
    /// Reject and requeue; the broker redelivers it, typically immediately.
    NackRequeue,
    /// Reject without requeue; the broker routes it to the dead-letter
    /// exchange.
    NackDiscard,
}

impl AckType {
    /// The `requeue` flag of the corresponding nack, or `None` for an ack.
    pub fn requeue(self) -> Option<bool> {
        match self {
            Self::Ack => None,
            Self::NackRequeue => Some(true),
            Self::NackDiscard => Some(false),
        }
    }
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::NackRequeue => write!(f, "nack (requeue)"),
            Self::NackDiscard => write!(f, "nack (discard)"),
        }
    }
}

/// Processes decoded messages of type `T` for one subscription.
///
/// The delivery loop awaits `handle` before pulling the next delivery, so
/// a handler never runs concurrently with itself on the same
/// subscription. A slow handler slows intake; it never causes unbounded
/// buffering.
///
/// Implemented for plain closures `Fn(T) -> AckType`. Wrap async closures
/// in [`AsyncHandler`].
pub trait Handler<T>: Send + Sync + 'static {
    /// Handles one message and decides its disposition.
    fn handle(&self, message: T) -> impl Future<Output = AckType> + Send;
}

impl<T, F> Handler<T> for F
where
    F: Fn(T) -> AckType + Send + Sync + 'static,
{
    fn handle(&self, message: T) -> impl Future<Output = AckType> + Send {
        std::future::ready(self(message))
    }
}

/// Adapts an async closure into a [`Handler`].
///
/// ```rust
/// use peril_pubsub::{AckType, AsyncHandler};
///
/// let handler = AsyncHandler(|count: u32| async move {
///     if count > 0 { AckType::Ack } else { AckType::NackDiscard }
/// });
/// # let _ = handler;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AsyncHandler<F>(pub F);

impl<T, F, Fut> Handler<T> for AsyncHandler<F>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckType> + Send,
{
    fn handle(&self, message: T) -> impl Future<Output = AckType> + Send {
        (self.0)(message)
    }
}
