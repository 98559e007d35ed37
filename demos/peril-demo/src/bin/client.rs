use peril::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    peril::init_tracing();

    let Some(username) = peril_demo::username_from_args(std::env::args()) else {
        eprintln!("usage: peril-client <username>");
        std::process::exit(2);
    };
    tracing::info!(%username, "starting Peril client");

    let connection = PerilConnection::connect(&ConnectionConfig::from_env()).await?;
    let subscription = peril_demo::start_client(&connection, &username).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    connection.close().await?;
    subscription.stopped().await;
    Ok(())
}
