use std::sync::Arc;

use anyhow::Context;

use marketgrid_provider::config::principal_from_env;
use marketgrid_provider::{DataService, ProviderConfig, RefreshWorker, build_provider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    marketgrid_observability::init();

    let config = ProviderConfig::from_env().context("invalid configuration")?;
    let provider = Arc::new(build_provider(&config).context("failed to build HTTP client")?);

    match principal_from_env().context("invalid principal")? {
        Some(principal) => provider.set_principal(principal),
        None => tracing::warn!("MARKETGRID_PRINCIPAL_ID not set; nothing to sync"),
    }

    let outcome = provider.start().await.context("startup refresh panicked")?;
    tracing::info!(
        ?outcome,
        status = %provider.status(),
        records = provider.snapshot().total_records(),
        "startup refresh finished"
    );

    if let Some(interval) = config.sync_interval {
        let worker = RefreshWorker::spawn(provider.clone(), interval);
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        worker.shutdown().await;
    }

    Ok(())
}
