//! Publishing typed values.
//!
//! [`publish`] works on any caller-supplied channel. [`Publisher`] bundles a
//! dedicated channel with a codec and serializes concurrent callers, since
//! a channel takes one writer at a time.

use peril_broker::{Broker, BrokerChannel, OutboundMessage};
use peril_codec::{BincodeCodec, Codec, JsonCodec};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{PubSub, PubSubError, SetupStep};

/// Encodes `value` with `codec` and publishes it to `exchange` under
/// `routing_key`, tagged with the codec's content type.
///
/// # Errors
/// - [`PubSubError::Encode`] if encoding fails. Nothing is sent.
/// - [`PubSubError::Publish`] if the broker refuses or fails the publish.
///   Not retried.
pub async fn publish<Ch, C, T>(
    channel: &Ch,
    codec: &C,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: BrokerChannel,
    C: Codec,
    T: Serialize,
{
    let body = codec.encode(value).map_err(PubSubError::Encode)?;
    let message = OutboundMessage {
        body: &body,
        content_type: codec.content_type(),
    };
    channel
        .publish(exchange, routing_key, message)
        .await
        .map_err(|source| PubSubError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            source,
        })?;
    tracing::debug!(
        exchange,
        routing_key,
        content_type = codec.content_type(),
        bytes = body.len(),
        "message published"
    );
    Ok(())
}

/// [`publish`] with [`JsonCodec`].
pub async fn publish_json<Ch: BrokerChannel, T: Serialize>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError> {
    publish(channel, &JsonCodec, exchange, routing_key, value).await
}

/// [`publish`] with [`BincodeCodec`].
pub async fn publish_bincode<Ch: BrokerChannel, T: Serialize>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError> {
    publish(channel, &BincodeCodec, exchange, routing_key, value).await
}

/// A publishing channel paired with a codec.
///
/// The channel is never shared with a subscription. Concurrent calls to
/// [`publish`](Self::publish) are serialized.
pub struct Publisher<Ch, C> {
    channel: Mutex<Ch>,
    codec: C,
}

impl<Ch: BrokerChannel, C: Codec> Publisher<Ch, C> {
    /// Wraps an already open channel.
    pub fn new(channel: Ch, codec: C) -> Self {
        Self {
            channel: Mutex::new(channel),
            codec,
        }
    }

    /// The codec used for every message.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Encodes and publishes `value`. See [`publish`].
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PubSubError> {
        let channel = self.channel.lock().await;
        publish(&*channel, &self.codec, exchange, routing_key, value).await
    }

    /// Closes the channel.
    ///
    /// # Errors
    /// Returns the broker error if the close itself fails.
    pub async fn close(self) -> Result<(), peril_broker::BrokerError> {
        self.channel.into_inner().close().await
    }
}

impl<B: Broker> PubSub<B> {
    /// Opens a dedicated publishing channel on the shared connection.
    ///
    /// # Errors
    /// Returns [`PubSubError::Connection`] if the channel can't be opened.
    pub async fn publisher<C: Codec>(
        &self,
        codec: C,
    ) -> Result<Publisher<B::Channel, C>, PubSubError> {
        let channel = self
            .broker()
            .open_channel()
            .await
            .map_err(PubSubError::setup(SetupStep::OpenChannel))?;
        Ok(Publisher::new(channel, codec))
    }
}
