use peril::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    peril::init_tracing();
    tracing::info!("starting Peril server");

    let connection = PerilConnection::connect(&ConnectionConfig::from_env()).await?;
    peril_demo::start_server(&connection).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    connection.close().await?;
    Ok(())
}
