//! Queue binder: declares a queue with a durability policy and binds it to
//! an exchange.

use peril_broker::{Broker, BrokerChannel, QueueArguments, QueueFlags};

use crate::{PubSub, PubSubError, SetupStep};

/// How long a queue lives and who may use it.
///
/// The queue flags are derived from the policy alone (see
/// [`queue_flags`](Self::queue_flags)); they are never set independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurabilityPolicy {
    /// Survives broker restarts, is never auto-deleted and may be shared by
    /// many connections. For persistent consumption groups.
    Durable,
    /// Exclusive to the declaring connection and deleted once its last
    /// consumer disconnects. For per-client ephemeral subscriptions.
    Transient,
}

impl DurabilityPolicy {
    /// The declare flags implied by this policy.
    pub fn queue_flags(self) -> QueueFlags {
        let durable = self == Self::Durable;
        QueueFlags {
            durable,
            auto_delete: !durable,
            exclusive: !durable,
        }
    }
}

/// A queue that has been declared and bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQueue {
    /// The queue name as reported by the broker.
    pub name: String,
    /// The policy it was declared with.
    pub policy: DurabilityPolicy,
}

impl<B: Broker> PubSub<B> {
    /// Opens a dedicated channel, declares `queue` under `policy` with the
    /// configured dead-letter exchange, and binds it to `exchange` under
    /// `routing_key`.
    ///
    /// Idempotent: repeating the call with the same arguments succeeds and
    /// leaves a single equivalent binding.
    ///
    /// # Errors
    /// Returns [`PubSubError::Connection`] naming the failed step. The
    /// channel is closed on failure; nothing partial is handed back.
    pub async fn declare_and_bind(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        policy: DurabilityPolicy,
    ) -> Result<(B::Channel, BoundQueue), PubSubError> {
        let channel = self
            .broker()
            .open_channel()
            .await
            .map_err(PubSubError::setup(SetupStep::OpenChannel))?;

        let dead_letter_exchange = self.config().dead_letter_exchange.as_str();
        match bind(&channel, dead_letter_exchange, exchange, queue, routing_key, policy).await {
            Ok(bound) => {
                tracing::debug!(
                    exchange,
                    queue = %bound.name,
                    routing_key,
                    ?policy,
                    "queue declared and bound"
                );
                Ok((channel, bound))
            }
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    tracing::debug!(error = %close_err, "couldn't close channel after failed setup");
                }
                Err(e)
            }
        }
    }
}

async fn bind<C: BrokerChannel>(
    channel: &C,
    dead_letter_exchange: &str,
    exchange: &str,
    queue: &str,
    routing_key: &str,
    policy: DurabilityPolicy,
) -> Result<BoundQueue, PubSubError> {
    let args = QueueArguments::dead_letter(dead_letter_exchange);
    let name = channel
        .declare_queue(queue, policy.queue_flags(), &args)
        .await
        .map_err(PubSubError::setup(SetupStep::DeclareQueue))?;
    channel
        .bind_queue(&name, exchange, routing_key)
        .await
        .map_err(PubSubError::setup(SetupStep::BindQueue))?;
    Ok(BoundQueue { name, policy })
}
