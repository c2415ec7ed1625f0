//! # POS Gateway Entry Point

use std::sync::Arc;

use migration::{Migrator, MigratorTrait};
use pos_gateway::{
    adapters::{AdapterRegistry, register_webhook_only_adapters},
    config::ConfigLoader,
    crypto::CryptoKey,
    db::init_pool,
    gateway::Gateway,
    normalization::Normalizer,
    repositories::SeaOrmRecordStore,
    store::{InMemoryMetricsStore, MetricsStore, RedisMetricsStore},
    telemetry::init_tracing,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::new().load()?;
    init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "Effective configuration");
    }

    let db = init_pool(&config).await?;
    Migrator::up(&db, None).await?;

    let crypto_key = CryptoKey::new(config.crypto_key.clone().unwrap_or_default())?;
    let records = Arc::new(SeaOrmRecordStore::new(Arc::new(db), crypto_key));

    let metrics: Arc<dyn MetricsStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisMetricsStore::connect(url).await?),
        None => {
            warn!("No Redis URL configured, rate counters are process-local");
            Arc::new(InMemoryMetricsStore::new())
        }
    };

    let normalizer = Normalizer::with_defaults(&config.normalization.amount_conventions);
    let mut adapters = AdapterRegistry::new();
    register_webhook_only_adapters(&mut adapters, normalizer.schemas());

    let gateway = Gateway::builder(config)
        .record_store(records)
        .metrics_store(metrics)
        .adapters(adapters)
        .build();
    gateway.start().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    gateway.shutdown().await;
    Ok(())
}
