//! In-process broker implementation.
//!
//! [`MemoryBroker`] plays the role of the broker server: it owns exchanges,
//! queues and bindings. Each [`MemoryBroker::connect`] call returns a
//! [`MemoryConnection`] that implements [`Broker`], so code written against
//! the port runs against it exactly as it would against AMQP.
//!
//! Modelled semantics:
//! - default (`""`), direct, topic and fanout exchanges
//! - per-consumer prefetch, round-robin dispatch between consumers
//! - ack, nack with requeue (to the head of the queue, `redelivered` set),
//!   nack without requeue (to the queue's dead-letter exchange, keeping the
//!   original routing key)
//! - exclusive queues owned by the declaring connection, auto-delete when
//!   the last consumer goes away
//! - unacknowledged deliveries return to the queue when their channel closes
//!
//! All state sits behind one `std::sync::Mutex`; no lock is held across an
//! `.await`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, ExchangeKind, OutboundMessage,
    QueueArguments, QueueFlags,
};

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be delivered.
    pub ready: usize,
    /// Messages delivered but not yet acked or nacked.
    pub unacked: usize,
    /// Active consumers.
    pub consumers: usize,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    content_type: String,
    routing_key: String,
    redelivered: bool,
}

struct Binding {
    queue: String,
    key: String,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

struct Consumer {
    id: u64,
    channel: u64,
    tag: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<MemoryDelivery>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    consumer: u64,
    channel: u64,
    message: Message,
}

struct Queue {
    flags: QueueFlags,
    args: QueueArguments,
    /// Owning connection of an exclusive queue.
    owner: Option<u64>,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

impl Queue {
    fn new(flags: QueueFlags, args: QueueArguments, owner: Option<u64>) -> Self {
        Self {
            flags,
            args,
            owner,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Next consumer with spare prefetch capacity, round-robin.
    fn next_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        let index = (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&i| self.consumers[i].has_capacity())?;
        self.cursor = (index + 1) % count;
        Some(index)
    }

    /// Moves matching unacked messages back to the head of the queue,
    /// preserving their original order.
    fn requeue_where(&mut self, pred: impl Fn(&Unacked) -> bool) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| pred(unacked))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }

    fn check_access(&self, name: &str, connection: u64) -> Result<(), BrokerError> {
        if self.owner.is_some_and(|owner| owner != connection) {
            return Err(BrokerError::ResourceLocked(format!(
                "cannot obtain exclusive access to locked queue '{name}'"
            )));
        }
        Ok(())
    }
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

#[derive(Default)]
struct State {
    handle: Weak<Mutex<State>>,
    next_id: u64,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&self, id: u64) -> Result<&ChannelState, BrokerError> {
        self.channels.get(&id).ok_or(BrokerError::ChannelClosed)
    }

    fn route(&mut self, exchange: &str, message: Message) -> Result<(), BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: routing key is the queue name.
            if self.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            let exchange_state = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &exchange_state.bindings {
                if exchange_state.kind.routes(&binding.key, &message.routing_key)
                    && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            tracing::trace!(
                exchange,
                routing_key = %message.routing_key,
                "unroutable message dropped"
            );
        }
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(&name);
        }
        Ok(())
    }

    /// Hands ready messages to consumers until the queue is empty or every
    /// consumer is at its prefetch limit.
    fn dispatch(&mut self, name: &str) {
        let State {
            handle,
            next_id,
            queues,
            ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(index) = queue.next_consumer() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            *next_id += 1;
            let tag = *next_id;

            let consumer = &mut queue.consumers[index];
            let delivery = MemoryDelivery {
                tag,
                channel: consumer.channel,
                queue: name.to_string(),
                message: message.clone(),
                state: handle.clone(),
            };
            match consumer.sender.send(delivery) {
                Ok(()) => {
                    consumer.in_flight += 1;
                    queue.unacked.insert(
                        tag,
                        Unacked {
                            consumer: consumer.id,
                            channel: consumer.channel,
                            message,
                        },
                    );
                }
                Err(_) => {
                    // The stream was dropped without cancelling.
                    queue.ready.push_front(message);
                    queue.consumers.remove(index);
                    queue.cursor = 0;
                }
            }
        }
    }

    fn settle(
        &mut self,
        queue_name: &str,
        channel: u64,
        tag: u64,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        if !self.channels.contains_key(&channel) {
            return Err(BrokerError::ChannelClosed);
        }
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        let unacked = queue
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == unacked.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        let mut message = unacked.message;
        let mut dead_letter = None;
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settlement::Discard => {
                if let Some(exchange) = queue.args.dead_letter_exchange.clone() {
                    message.redelivered = false;
                    dead_letter = Some((exchange, message));
                }
            }
        }

        if let Some((exchange, message)) = dead_letter {
            // A missing dead-letter exchange drops the message, as AMQP does.
            if let Err(e) = self.route(&exchange, message) {
                tracing::debug!(queue = queue_name, error = %e, "dead-lettered message dropped");
            }
        }
        self.dispatch(queue_name);
        Ok(())
    }

    fn cancel_consumer(&mut self, queue_name: &str, consumer: u64) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let before = queue.consumers.len();
        queue.consumers.retain(|c| c.id != consumer);
        queue.requeue_where(|unacked| unacked.consumer == consumer);
        queue.cursor = 0;
        if before > 0 && queue.consumers.is_empty() && queue.flags.auto_delete {
            self.delete_queue(queue_name);
        } else {
            self.dispatch(queue_name);
        }
    }

    fn close_channel(&mut self, id: u64) {
        if self.channels.remove(&id).is_none() {
            return;
        }
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != id);
            queue.requeue_where(|unacked| unacked.channel == id);
            queue.cursor = 0;
            if before > 0 && queue.consumers.is_empty() && queue.flags.auto_delete {
                self.delete_queue(&name);
            } else {
                self.dispatch(&name);
            }
        }
    }

    fn close_connection(&mut self, id: u64) {
        if !self.connections.remove(&id) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            tracing::debug!(queue = name, "queue deleted");
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// An in-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Creates an empty broker with no exchanges or queues.
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|handle| {
            Mutex::new(State {
                handle: handle.clone(),
                ..State::default()
            })
        });
        Self { state }
    }

    /// Opens a new client connection.
    pub fn connect(&self) -> MemoryConnection {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.connections.insert(id);
        MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Counters for `queue`, or `None` if it doesn't exist.
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = lock(&self.state);
        state.queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
        })
    }

    /// The flags `queue` was declared with.
    pub fn queue_flags(&self, queue: &str) -> Option<QueueFlags> {
        lock(&self.state).queues.get(queue).map(|q| q.flags)
    }

    /// The arguments `queue` was declared with.
    pub fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        lock(&self.state).queues.get(queue).map(|q| q.args.clone())
    }

    /// Bodies of the messages waiting in `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// `(queue, binding key)` pairs bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        lock(&self.state)
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// A client connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl MemoryConnection {
    /// Whether [`close`](Broker::close) has been called.
    pub fn is_closed(&self) -> bool {
        !lock(&self.state).connections.contains(&self.id)
    }
}

impl Broker for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError> {
        let mut state = lock(&self.state);
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
            },
        );
        Ok(MemoryChannel {
            id,
            connection: self.id,
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.state).close_connection(self.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Cancels its consumer when the delivery stream is dropped.
struct ConsumerGuard {
    state: Weak<Mutex<State>>,
    queue: String,
    consumer: u64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).cancel_consumer(&self.queue, self.consumer);
        }
    }
}

impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.channel(self.id)?;
        if name.is_empty() {
            return Err(BrokerError::PreconditionFailed(
                "the default exchange can't be redeclared".into(),
            ));
        }
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind || existing.durable != durable {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{name}'"
                )));
            }
            return Ok(());
        }
        state.exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                durable,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        args: &QueueArguments,
    ) -> Result<String, BrokerError> {
        let mut state = lock(&self.state);
        state.channel(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            existing.check_access(&name, self.connection)?;
            if existing.flags != flags || existing.args != *args {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{name}'"
                )));
            }
            return Ok(name);
        }

        let owner = flags.exclusive.then_some(self.connection);
        state
            .queues
            .insert(name.clone(), Queue::new(flags, args.clone(), owner));
        tracing::debug!(queue = %name, ?flags, "queue declared");
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.channel(self.id)?;
        state
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::queue_not_found(queue))?
            .check_access(queue, self.connection)?;
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
        let exists = exchange_state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.key == routing_key);
        if !exists {
            exchange_state.bindings.push(Binding {
                queue: queue.to_string(),
                key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::ChannelClosed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<Self::Delivery>, BrokerError> {
        let mut state = lock(&self.state);
        let prefetch = state.channel(self.id)?.prefetch;
        let id = state.next_id();
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{id}")
        } else {
            consumer_tag.to_string()
        };

        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::queue_not_found(queue))?;
        queue_state.check_access(queue, self.connection)?;
        if queue_state
            .consumers
            .iter()
            .any(|c| c.channel == self.id && c.tag == tag)
        {
            return Err(BrokerError::PreconditionFailed(format!(
                "attempt to reuse consumer tag '{tag}'"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push(Consumer {
            id,
            channel: self.id,
            tag,
            prefetch,
            in_flight: 0,
            sender,
        });
        state.dispatch(queue);

        let guard = ConsumerGuard {
            state: Arc::downgrade(&self.state),
            queue: queue.to_string(),
            consumer: id,
        };
        let stream = futures_util::stream::unfold(
            (receiver, guard),
            |(mut receiver, guard)| async move {
                let delivery = receiver.recv().await?;
                Some((Ok(delivery), (receiver, guard)))
            },
        );
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage<'_>,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.channel(self.id)?;
        state.route(
            exchange,
            Message {
                body: message.body.to_vec(),
                content_type: message.content_type.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            },
        )
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.state).close_channel(self.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDelivery
// ---------------------------------------------------------------------------

/// A delivery handed out by a [`MemoryBroker`].
pub struct MemoryDelivery {
    tag: u64,
    channel: u64,
    queue: String,
    message: Message,
    state: Weak<Mutex<State>>,
}

impl fmt::Debug for MemoryDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDelivery")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("routing_key", &self.message.routing_key)
            .field("redelivered", &self.message.redelivered)
            .finish_non_exhaustive()
    }
}

impl MemoryDelivery {
    /// The `content-type` the message was published with.
    pub fn content_type(&self) -> &str {
        &self.message.content_type
    }

    fn settle(self, settlement: Settlement) -> Result<(), BrokerError> {
        let state = self.state.upgrade().ok_or(BrokerError::ConnectionClosed)?;
        let mut state = lock(&state);
        state.settle(&self.queue, self.channel, self.tag, settlement)
    }
}

impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self) -> Result<(), BrokerError> {
        self.settle(Settlement::Ack)
    }

    async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        })
    }
}
