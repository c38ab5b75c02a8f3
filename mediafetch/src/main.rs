use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use mediafetch::config::AppConfig;
use mediafetch::database;
use mediafetch::logging::init_logging;
use mediafetch::platform::{HttpDeliverySender, HttpPayloadFetcher, HttpSourceFetcher};
use mediafetch::services::{Collaborators, ServiceContainer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let (logging, _guard) = init_logging(&config.logging)?;

    let bridge = config
        .bridge
        .clone()
        .context("MEDIAFETCH_BRIDGE_URL must point at the platform adapter service")?;

    let pool =
        database::init_pool_with_size(&config.database.url, config.database.max_connections)
            .await?;
    database::run_migrations(&pool).await?;

    let collaborators = Collaborators {
        source_fetcher: Arc::new(HttpSourceFetcher::new(&bridge)?),
        payload_fetcher: Arc::new(HttpPayloadFetcher::new(config.payload_fetcher.clone())?),
        sender: Arc::new(HttpDeliverySender::new(&bridge)?),
    };

    let container = ServiceContainer::new(pool, &config, collaborators)?;
    container.start().await?;
    logging.start_retention_cleanup(container.cancellation_token());

    info!(bridge = %bridge.base_url, "mediafetch running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    container.shutdown().await?;
    Ok(())
}
