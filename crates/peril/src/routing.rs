//! Exchange names, routing keys and the messages that travel on them.
//!
//! The engine treats all of these as opaque strings. Keys are hierarchical
//! and dot-separated (`<prefix>.<id>`); topic bindings may use `*` for one
//! segment and `#` for any number of segments.

use serde::{Deserialize, Serialize};

/// Direct exchange for point-to-point game control messages.
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";

/// Topic exchange for per-player game traffic.
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

/// Fanout exchange receiving every discard-rejected message.
pub const EXCHANGE_PERIL_DEAD_LETTER: &str = peril_pubsub::DEFAULT_DEAD_LETTER_EXCHANGE;

/// Durable queue bound to [`EXCHANGE_PERIL_DEAD_LETTER`].
pub const QUEUE_PERIL_DEAD_LETTER: &str = peril_pubsub::DEFAULT_DEAD_LETTER_QUEUE;

/// Pause and resume broadcasts.
pub const PAUSE_KEY: &str = "pause";

/// Army moves, keyed `army_moves.<username>`.
pub const ARMY_MOVES_PREFIX: &str = "army_moves";

/// War recognitions, keyed `war.<username>`.
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";

/// Game log entries, keyed `game_logs.<username>`.
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Joins `prefix` and `id` into a routing key.
///
/// ```rust
/// assert_eq!(peril::routing::key("army_moves", "alice"), "army_moves.alice");
/// assert_eq!(peril::routing::key("army_moves", "*"), "army_moves.*");
/// ```
pub fn key(prefix: &str, id: &str) -> String {
    format!("{prefix}.{id}")
}

/// Broadcast by the server on [`PAUSE_KEY`] to pause or resume the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayingState {
    pub is_paused: bool,
}
