//! The snapshot collaborator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use marketgrid_core::{Principal, RawSnapshot};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("client is offline")]
    Offline,
    #[error("network error: {0}")]
    Network(String),
    #[error("API error ({0}): {1}")]
    Api(u16, String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Fetches every entity collection visible to a principal in one call.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, principal: &Principal) -> Result<RawSnapshot, FetchError>;
}

/// In-memory source that replays scripted results, for tests/dev.
///
/// Once the script runs out, the last entry repeats. An optional latency
/// keeps each fetch in flight for a while.
#[derive(Debug, Default)]
pub struct InMemorySnapshotSource {
    script: Mutex<VecDeque<Result<RawSnapshot, FetchError>>>,
    last: Mutex<Option<Result<RawSnapshot, FetchError>>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl InMemorySnapshotSource {
    pub fn new(script: impl IntoIterator<Item = Result<RawSnapshot, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Always returns `payload`.
    pub fn serving(payload: RawSnapshot) -> Self {
        Self::new([Ok(payload)])
    }

    /// Always fails with `error`.
    pub fn failing(error: FetchError) -> Self {
        Self::new([Err(error)])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Append a result after the current script.
    pub fn push(&self, result: Result<RawSnapshot, FetchError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for InMemorySnapshotSource {
    async fn fetch_snapshot(&self, principal: &Principal) -> Result<RawSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%principal, "serving in-memory snapshot");

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Err(FetchError::Network("no snapshot scripted".to_string())))
    }
}
