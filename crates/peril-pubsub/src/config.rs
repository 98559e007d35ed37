//! Engine configuration and the subscription state machine.

use tracing::warn;

// ---------------------------------------------------------------------------
// PubSubConfig
// ---------------------------------------------------------------------------

/// Default number of unacknowledged deliveries per subscription.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Longest consumer tag the broker accepts (an AMQP short string).
pub const MAX_CONSUMER_TAG_LEN: usize = 255;

/// Default dead-letter exchange every declared queue points to.
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

/// Default queue collecting everything routed to the dead-letter exchange.
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "peril_dlq";

/// What the delivery loop does with a message it can't decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Reject without requeue, so the message lands on the dead-letter
    /// exchange instead of being redelivered forever.
    #[default]
    Discard,
    /// Neither ack nor nack. The delivery stays unacknowledged until the
    /// channel closes, after which the broker requeues it.
    Leave,
}

/// Configuration shared by every subscription and publisher of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Exchange set as `x-dead-letter-exchange` on every declared queue.
    pub dead_letter_exchange: String,

    /// Durable queue bound to the dead-letter exchange by
    /// [`declare_topology`](crate::PubSub::declare_topology).
    pub dead_letter_queue: String,

    /// Maximum unacknowledged deliveries the broker may hand to one
    /// subscription. Bounds memory and throttles intake to handler speed.
    pub prefetch_count: u16,

    /// Prefix of generated consumer tags (`<prefix>-<queue>-<random>`).
    pub consumer_tag_prefix: String,

    /// Handling of undecodable deliveries.
    pub decode_failure: DecodeFailurePolicy,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            consumer_tag_prefix: "peril".to_string(),
            decode_failure: DecodeFailurePolicy::default(),
        }
    }
}

impl PubSubConfig {
    /// Fix any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`PubSub::new`](crate::PubSub::new). Rules:
    /// - `prefetch_count` of 0 means "unlimited" to an AMQP broker, which
    ///   would disable backpressure, so it is raised to 1.
    /// - An empty `dead_letter_exchange` falls back to the default, because
    ///   every queue must have somewhere to send discarded messages.
    pub fn validated(mut self) -> Self {
        if self.prefetch_count == 0 {
            warn!("prefetch_count of 0 disables backpressure; using 1");
            self.prefetch_count = 1;
        }
        if self.dead_letter_exchange.is_empty() {
            warn!(
                default = DEFAULT_DEAD_LETTER_EXCHANGE,
                "empty dead_letter_exchange; using default"
            );
            self.dead_letter_exchange = DEFAULT_DEAD_LETTER_EXCHANGE.to_string();
        }
        if self.dead_letter_queue.is_empty() {
            self.dead_letter_queue = DEFAULT_DEAD_LETTER_QUEUE.to_string();
        }
        self
    }

    /// A consumer tag unique to this subscription.
    ///
    /// The prefix and queue name are cut on a char boundary so the whole
    /// tag never exceeds [`MAX_CONSUMER_TAG_LEN`] bytes. The random suffix
    /// is always kept.
    pub fn consumer_tag(&self, queue: &str) -> String {
        // Two separators and eight hex digits.
        let mut budget = MAX_CONSUMER_TAG_LEN - 10;
        let prefix = truncate(&self.consumer_tag_prefix, budget);
        budget -= prefix.len();
        let queue = truncate(queue, budget);
        format!("{prefix}-{queue}-{:08x}", rand::random::<u32>())
    }
}

/// The longest prefix of `s` that fits in `max` bytes.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// SubscriptionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a subscription.
///
/// Transitions are strictly ordered:
///
/// ```text
/// Setup → Running → Stopped
/// ```
///
/// - **Setup**: the queue is being declared and bound, prefetch set and
///   the consumer started.
/// - **Running**: the worker task is pulling deliveries and invoking the
///   handler, one at a time.
/// - **Stopped**: the delivery stream closed (channel or connection
///   closed). Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Setup,
    Running,
    Stopped,
}

impl SubscriptionState {
    /// Returns the following state, or `None` from `Stopped`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Setup => Some(Self::Running),
            Self::Running => Some(Self::Stopped),
            Self::Stopped => None,
        }
    }

    /// Returns `true` if transitioning to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        self.next() == Some(target)
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "Setup"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
