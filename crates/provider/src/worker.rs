//! Background worker for periodic snapshot refreshes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::provider::DataService;

/// Triggers an automatic refresh every `interval` until shut down.
///
/// Ticks that land while a sync is still in flight coalesce like any other
/// automatic refresh.
#[derive(Debug)]
pub struct RefreshWorker {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RefreshWorker {
    /// Spawn the worker. The first tick fires one `interval` from now; the
    /// startup refresh is the provider's job.
    pub fn spawn(service: Arc<dyn DataService>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "refresh worker started");

            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => {
                        tracing::info!("refresh worker received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let synced = service.refresh(false).await;
                        tracing::debug!(synced, status = %service.status(), "periodic refresh finished");
                    }
                }
            }

            tracing::info!("refresh worker stopped");
        });

        Self { shutdown, handle }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "refresh worker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DataProvider;
    use marketgrid_ai::ScriptedBackend;
    use marketgrid_core::{Principal, PrincipalId, Role};
    use marketgrid_sync::InMemorySnapshotSource;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_every_tick_until_shutdown() {
        let source = Arc::new(InMemorySnapshotSource::serving(json!({"orders": []})));
        let provider = Arc::new(
            DataProvider::builder(source.clone(), Arc::new(ScriptedBackend::answering("ok")))
                .with_principal(Principal::new(PrincipalId::new(), Role::Supplier))
                .build(),
        );

        let worker = RefreshWorker::spawn(provider.clone(), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 0);

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(source.calls(), 2);
        assert_eq!(provider.stats().cycles_completed, 2);

        worker.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.calls(), 2);
    }
}
