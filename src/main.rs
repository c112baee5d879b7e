// src/main.rs

use std::sync::Arc;

use anyhow::{Context, Result};
use segsize::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let store = SqliteStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::new(config.user_agent.clone(), config.request_timeout())
            .context("building http client")?,
    );

    if config.refresh_catalog {
        let catalog = CatalogClient::new(
            transport.clone(),
            Arc::new(config.catalog_retry_policies()),
            config.api_url.clone(),
        );
        let now = chrono::Local::now().naive_local();
        if let Err(e) = catalog.refresh(&store, now).await {
            error!("catalog refresh failed: {e}");
        }
    }

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current video");
            ctrl_c.cancel();
        }
    });

    let manager = EncodingManager::from_config(&config, transport).with_shutdown(shutdown);
    let summary = manager.run(&store).await.context("segment size pass")?;
    info!(
        pending = summary.pending,
        attempted = summary.attempted,
        persisted = summary.persisted,
        failed = summary.failed,
        deadline_reached = summary.deadline_reached,
        cancelled = summary.cancelled,
        "done"
    );
    Ok(())
}
