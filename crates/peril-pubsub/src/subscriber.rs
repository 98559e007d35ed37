//! Subscriptions: one Tokio task per subscription, driving a delivery loop.
//!
//! The worker owns its channel and consumption stream. For each delivery it
//! decodes the body, awaits the handler and settles the delivery according
//! to the handler's [`AckType`]. It stops only when the stream ends, i.e.
//! when its channel or the shared connection closes.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use peril_broker::{Broker, BrokerChannel, Delivery, DeliveryStream};
use peril_codec::{BincodeCodec, Codec, CodecError, JsonCodec};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::{
    AckType, DecodeFailurePolicy, DurabilityPolicy, Handler, PubSub, PubSubError, SetupStep,
    SubscriptionState,
};

/// Snapshot of a subscription's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Deliveries pulled from the stream.
    pub delivered: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries rejected with requeue.
    pub requeued: u64,
    /// Deliveries rejected without requeue, including decode failures
    /// under [`DecodeFailurePolicy::Discard`].
    pub discarded: u64,
    /// Deliveries whose body couldn't be decoded.
    pub decode_failures: u64,
    /// Ack or nack calls that failed.
    pub ack_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    decode_failures: AtomicU64,
    ack_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn settled(&self, ack: AckType) {
        match ack {
            AckType::Ack => Self::bump(&self.acked),
            AckType::NackRequeue => Self::bump(&self.requeued),
            AckType::NackDiscard => Self::bump(&self.discarded),
        }
    }

    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not stop the worker. The worker ends when its
/// consumption stream closes, typically because the shared connection was
/// closed at shutdown. A worker that ends any other way, such as a panicking
/// handler, still reports [`SubscriptionState::Stopped`].
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    state: watch::Receiver<SubscriptionState>,
    counters: Arc<Counters>,
}

impl Subscription {
    /// The queue name as reported by the broker.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Counters as of now.
    pub fn stats(&self) -> SubscriptionStats {
        self.counters.snapshot()
    }

    /// Waits until the worker has stopped.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        // Err means the sender was dropped, so the worker has exited.
        let _ = state
            .wait_for(|state| *state == SubscriptionState::Stopped)
            .await;
    }
}

impl<B: Broker> PubSub<B> {
    /// Subscribes `handler` to messages routed from `exchange` under
    /// `routing_key` into `queue`.
    ///
    /// Declares and binds the queue, sets the prefetch limit, starts
    /// consuming, then spawns the delivery loop and returns. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`PubSubError::Connection`] naming the failed setup step.
    /// Nothing is spawned in that case.
    pub async fn subscribe<T, C, H>(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        policy: DurabilityPolicy,
        codec: C,
        handler: H,
    ) -> Result<Subscription, PubSubError>
    where
        T: DeserializeOwned + Send + 'static,
        C: Codec,
        H: Handler<T>,
    {
        let (channel, bound) = self
            .declare_and_bind(exchange, queue, routing_key, policy)
            .await?;

        let stream = match self.start_consuming(&channel, &bound.name).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    tracing::debug!(error = %close_err, "couldn't close channel after failed setup");
                }
                return Err(e);
            }
        };

        let (state_tx, state_rx) = watch::channel(SubscriptionState::Setup);
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            channel,
            codec,
            handler,
            queue: bound.name.clone(),
            decode_failure: self.config().decode_failure,
            counters: Arc::clone(&counters),
            state: state_tx,
            _message: PhantomData,
        };
        tokio::spawn(worker.run(stream));

        Ok(Subscription {
            queue: bound.name,
            state: state_rx,
            counters,
        })
    }

    /// [`subscribe`](Self::subscribe) with JSON-encoded messages.
    pub async fn subscribe_json<T, H>(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        policy: DurabilityPolicy,
        handler: H,
    ) -> Result<Subscription, PubSubError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe(exchange, queue, routing_key, policy, JsonCodec, handler)
            .await
    }

    /// [`subscribe`](Self::subscribe) with bincode-encoded messages.
    pub async fn subscribe_bincode<T, H>(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        policy: DurabilityPolicy,
        handler: H,
    ) -> Result<Subscription, PubSubError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe(exchange, queue, routing_key, policy, BincodeCodec, handler)
            .await
    }

    async fn start_consuming(
        &self,
        channel: &B::Channel,
        queue: &str,
    ) -> Result<DeliveryStream<<B::Channel as BrokerChannel>::Delivery>, PubSubError> {
        channel
            .set_prefetch(self.config().prefetch_count)
            .await
            .map_err(PubSubError::setup(SetupStep::SetPrefetch))?;
        let tag = self.config().consumer_tag(queue);
        channel
            .consume(queue, &tag)
            .await
            .map_err(PubSubError::setup(SetupStep::Consume))
    }
}

/// The delivery loop of one subscription.
struct Worker<Ch, C, H, T> {
    // Held so the channel lives exactly as long as the loop.
    channel: Ch,
    codec: C,
    handler: H,
    queue: String,
    decode_failure: DecodeFailurePolicy,
    counters: Arc<Counters>,
    state: watch::Sender<SubscriptionState>,
    _message: PhantomData<fn() -> T>,
}

impl<Ch, C, H, T> Worker<Ch, C, H, T>
where
    Ch: BrokerChannel,
    C: Codec,
    H: Handler<T>,
    T: DeserializeOwned + Send + 'static,
{
    async fn run(self, mut stream: DeliveryStream<Ch::Delivery>) {
        self.transition(SubscriptionState::Running);
        tracing::info!(queue = %self.queue, "subscription running");

        while let Some(next) = stream.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::warn!(queue = %self.queue, error = %e, "consumer stream error");
                    continue;
                }
            };
            Counters::bump(&self.counters.delivered);

            match self.codec.decode::<T>(delivery.body()) {
                Ok(message) => {
                    let ack = self.handler.handle(message).await;
                    self.settle(delivery, ack).await;
                }
                Err(e) => self.reject_undecodable(delivery, e).await,
            }
        }

        self.transition(SubscriptionState::Stopped);
        let stats = self.counters.snapshot();
        tracing::info!(
            queue = %self.queue,
            delivered = stats.delivered,
            acked = stats.acked,
            decode_failures = stats.decode_failures,
            "subscription stopped"
        );
        // The stream is closed already; this only releases the channel.
        if let Err(e) = self.channel.close().await {
            tracing::trace!(queue = %self.queue, error = %e, "channel already closed");
        }
    }

    async fn settle(&self, delivery: Ch::Delivery, ack: AckType) {
        let delivery_tag = delivery.delivery_tag();
        let result = match ack.requeue() {
            None => delivery.ack().await,
            Some(requeue) => delivery.nack(requeue).await,
        };
        match result {
            Ok(()) => {
                self.counters.settled(ack);
                tracing::trace!(queue = %self.queue, delivery_tag, %ack, "delivery settled");
            }
            Err(source) => {
                Counters::bump(&self.counters.ack_failures);
                let err = PubSubError::Ack {
                    delivery_tag,
                    ack,
                    source,
                };
                tracing::warn!(queue = %self.queue, error = %err, "acknowledgment failed");
            }
        }
    }

    async fn reject_undecodable(&self, delivery: Ch::Delivery, error: CodecError) {
        Counters::bump(&self.counters.decode_failures);
        let err = PubSubError::Decode(error);
        tracing::warn!(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag(),
            routing_key = delivery.routing_key(),
            policy = ?self.decode_failure,
            error = %err,
            "couldn't decode delivery"
        );
        match self.decode_failure {
            DecodeFailurePolicy::Discard => self.settle(delivery, AckType::NackDiscard).await,
            // Left unsettled; the broker requeues it when the channel closes.
            DecodeFailurePolicy::Leave => drop(delivery),
        }
    }

    fn transition(&self, target: SubscriptionState) {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(target) {
                *state = target;
                true
            } else {
                false
            }
        });
    }
}

impl<Ch, C, H, T> Drop for Worker<Ch, C, H, T> {
    fn drop(&mut self) {
        let stopped = self.state.send_if_modified(|state| {
            if *state == SubscriptionState::Stopped {
                false
            } else {
                *state = SubscriptionState::Stopped;
                true
            }
        });
        if stopped {
            tracing::warn!(queue = %self.queue, "subscription worker exited abnormally");
        }
    }
}
