//! The engine handle shared by subscriptions and publishers.

use std::sync::Arc;

use peril_broker::{Broker, BrokerChannel, ExchangeKind, QueueArguments, QueueFlags};

use crate::{PubSubConfig, PubSubError, SetupStep};

/// Entry point of the pub/sub engine.
///
/// Holds the process-wide broker connection and the engine configuration.
/// Cheap to clone; every subscription opens its own channel on the shared
/// connection.
pub struct PubSub<B: Broker> {
    broker: Arc<B>,
    config: PubSubConfig,
}

impl<B: Broker> Clone for PubSub<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            config: self.config.clone(),
        }
    }
}

impl<B: Broker> PubSub<B> {
    /// Creates an engine over `broker`. The config is
    /// [validated](PubSubConfig::validated) first.
    pub fn new(broker: Arc<B>, config: PubSubConfig) -> Self {
        Self {
            broker,
            config: config.validated(),
        }
    }

    /// The shared broker connection.
    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// The effective configuration.
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Declares the durable exchanges in `exchanges`, the fanout
    /// dead-letter exchange and the durable dead-letter queue bound to it.
    ///
    /// Safe to call on every start-up; redeclaring identical topology is a
    /// no-op.
    ///
    /// # Errors
    /// Returns [`PubSubError::Connection`] on the first failed declaration.
    pub async fn declare_topology(
        &self,
        exchanges: &[(&str, ExchangeKind)],
    ) -> Result<(), PubSubError> {
        let channel = self
            .broker
            .open_channel()
            .await
            .map_err(PubSubError::setup(SetupStep::OpenChannel))?;

        let result = declare_all(&channel, &self.config, exchanges).await;
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "couldn't close topology channel");
        }
        result?;

        tracing::info!(
            exchanges = exchanges.len(),
            dead_letter_exchange = %self.config.dead_letter_exchange,
            "topology declared"
        );
        Ok(())
    }
}

async fn declare_all<C: BrokerChannel>(
    channel: &C,
    config: &PubSubConfig,
    exchanges: &[(&str, ExchangeKind)],
) -> Result<(), PubSubError> {
    for (name, kind) in exchanges {
        channel
            .declare_exchange(name, *kind, true)
            .await
            .map_err(PubSubError::setup(SetupStep::DeclareExchange))?;
    }
    channel
        .declare_exchange(&config.dead_letter_exchange, ExchangeKind::Fanout, true)
        .await
        .map_err(PubSubError::setup(SetupStep::DeclareExchange))?;

    // The dead-letter queue has no dead-letter exchange of its own.
    let flags = QueueFlags {
        durable: true,
        ..QueueFlags::default()
    };
    let queue = channel
        .declare_queue(&config.dead_letter_queue, flags, &QueueArguments::default())
        .await
        .map_err(PubSubError::setup(SetupStep::DeclareQueue))?;
    channel
        .bind_queue(&queue, &config.dead_letter_exchange, "")
        .await
        .map_err(PubSubError::setup(SetupStep::BindQueue))?;
    Ok(())
}
