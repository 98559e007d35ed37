//! Server and client start-up flows shared by the `peril-server` and
//! `peril-client` binaries.

use peril::broker::Broker;
use peril::prelude::*;
use peril::routing::{self, PlayingState};

/// Declares the game topology and broadcasts a pause.
pub async fn start_server<B: Broker>(connection: &PerilConnection<B>) -> Result<(), PerilError> {
    connection.declare_game_topology().await?;

    let publisher = connection.pubsub().publisher(JsonCodec).await?;
    publisher
        .publish(
            routing::EXCHANGE_PERIL_DIRECT,
            routing::PAUSE_KEY,
            &PlayingState { is_paused: true },
        )
        .await?;
    publisher.close().await?;
    tracing::info!("pause broadcast sent");
    Ok(())
}

/// Subscribes `username` to pause broadcasts on a transient queue.
pub async fn start_client<B: Broker>(
    connection: &PerilConnection<B>,
    username: &str,
) -> Result<Subscription, PerilError> {
    let queue = routing::key(routing::PAUSE_KEY, username);
    let subscription = connection
        .pubsub()
        .subscribe_json(
            routing::EXCHANGE_PERIL_DIRECT,
            &queue,
            routing::PAUSE_KEY,
            DurabilityPolicy::Transient,
            handle_pause,
        )
        .await?;
    tracing::info!(queue = subscription.queue(), "subscribed to pause broadcasts");
    Ok(subscription)
}

fn handle_pause(state: PlayingState) -> AckType {
    if state.is_paused {
        tracing::info!("game paused");
    } else {
        tracing::info!("game resumed");
    }
    AckType::Ack
}

/// Picks the username from the command line: the first argument after
/// the program name, trimmed. Usernames become routing key segments, so
/// dots and wildcards are refused.
pub fn username_from_args(args: impl IntoIterator<Item = String>) -> Option<String> {
    let username = args.into_iter().nth(1)?.trim().to_string();
    let valid = !username.is_empty()
        && !username.contains(['.', '*', '#'])
        && !username.contains(char::is_whitespace);
    valid.then_some(username)
}
