use std::sync::Arc;

use anyhow::Context;
use delta_consumption::{
    config::EngineConfig, coordinator::Coordinator, rest_store::RestStateStore,
    store::StaticRegistry,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = EngineConfig::from_env();
    let entities_file = config
        .entities_file
        .clone()
        .context("DELTA_ENTITIES must point to the entity file")?;
    let registry = Arc::new(StaticRegistry::load(&entities_file)?);
    info!(
        store = %config.store_url,
        entities = %entities_file.display(),
        "starting delta consumption"
    );

    let store = Arc::new(RestStateStore::from_config(&config));
    let engine = Coordinator::start(&config, store, registry).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    engine.shutdown().await
}
