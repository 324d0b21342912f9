//! The shared data provider.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use marketgrid_ai::{
    BackoffRetrier, CancellationToken, CredentialRecalibrator, DEFAULT_COOLDOWN,
    InferenceBackend, InferenceRequest, InferenceResponse, NoopRecalibrator, RateLimitGovernor,
    RetryPolicy,
};
use marketgrid_core::{GridResult, InferenceFailure, Principal, Snapshot};
use marketgrid_events::{EventBus, Notice, NoticeBus, Subscription};
use marketgrid_sync::{RefreshMode, SnapshotSource, SyncOutcome, SyncSession, SyncStats, SyncStatus};

use crate::config::ProviderConfig;

/// What the rest of the application depends on.
///
/// Consumers receive an `Arc<dyn DataService>` instead of reaching for
/// process-wide state.
#[async_trait]
pub trait DataService: Send + Sync {
    /// Latest published snapshot.
    fn snapshot(&self) -> Arc<Snapshot>;

    fn status(&self) -> SyncStatus;

    /// Refresh for the current principal. `true` only if a new snapshot
    /// was published.
    async fn refresh(&self, manual: bool) -> bool;

    fn subscribe_snapshot(&self) -> watch::Receiver<Arc<Snapshot>>;

    fn subscribe_status(&self) -> watch::Receiver<SyncStatus>;

    /// One guarded, retried call to the inference backend.
    async fn infer(&self, request: InferenceRequest) -> GridResult<InferenceResponse>;
}

/// Composition root: owns the snapshot session, the rate-limit governor and
/// the retrier, and the notice bus they report to.
pub struct DataProvider {
    session: SyncSession,
    governor: Arc<RateLimitGovernor>,
    retrier: BackoffRetrier,
    backend: Arc<dyn InferenceBackend>,
    policy: RetryPolicy,
    principal: RwLock<Option<Principal>>,
    notices: Arc<NoticeBus>,
}

impl DataProvider {
    pub fn builder(
        source: Arc<dyn SnapshotSource>,
        backend: Arc<dyn InferenceBackend>,
    ) -> DataProviderBuilder {
        DataProviderBuilder {
            source,
            backend,
            recalibrator: Arc::new(NoopRecalibrator),
            policy: RetryPolicy::default(),
            quota_cooldown: DEFAULT_COOLDOWN,
            principal: None,
        }
    }

    /// Kick off the startup refresh in the background.
    pub fn start(self: &Arc<Self>) -> JoinHandle<SyncOutcome> {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            info!("data provider starting");
            provider.refresh_with(RefreshMode::Automatic).await
        })
    }

    pub fn principal(&self) -> Option<Principal> {
        self.principal
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch the principal subsequent refreshes sync for.
    ///
    /// A different principal discards the current snapshot; fetches still
    /// running for the old one are dropped when they return.
    pub fn set_principal(&self, principal: Principal) {
        let mut current = self.principal.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() != Some(&principal) {
            self.session.switch_principal();
        }
        info!(%principal, "principal set");
        *current = Some(principal);
    }

    /// Forget the principal and the data synced for it.
    pub fn clear_principal(&self) {
        let mut current = self.principal.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            self.session.switch_principal();
            info!(principal = %previous, "principal cleared");
        }
    }

    pub async fn refresh_with(&self, mode: RefreshMode) -> SyncOutcome {
        let (principal, epoch) = {
            let current = self.principal.read().unwrap_or_else(PoisonError::into_inner);
            (current.clone(), self.session.epoch())
        };
        self.session.refresh_in(principal.as_ref(), epoch, mode).await
    }

    pub fn stats(&self) -> SyncStats {
        self.session.stats()
    }

    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    /// Notices (stalls, saturation, recalibration) published from now on.
    pub fn subscribe_notices(&self) -> Subscription<Notice> {
        self.notices.subscribe()
    }

    /// Run `op` behind the governor and the retrier.
    ///
    /// While saturated the call fails with `GridSaturated` before `op` runs;
    /// otherwise `op` is attempted under `policy`.
    pub async fn invoke_inference<T, F, Fut>(&self, op: F, policy: &RetryPolicy) -> GridResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InferenceFailure>>,
    {
        self.governor
            .guard(|| self.retrier.execute(op, policy))
            .await
    }

    /// [`invoke_inference`](Self::invoke_inference) that the caller can
    /// abandon through `cancel`.
    pub async fn invoke_inference_with_cancel<T, F, Fut>(
        &self,
        op: F,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> GridResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InferenceFailure>>,
    {
        self.governor
            .guard(|| self.retrier.execute_with_cancel(op, policy, cancel))
            .await
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl DataService for DataProvider {
    fn snapshot(&self) -> Arc<Snapshot> {
        self.session.snapshot()
    }

    fn status(&self) -> SyncStatus {
        self.session.status()
    }

    async fn refresh(&self, manual: bool) -> bool {
        self.refresh_with(RefreshMode::from_manual(manual))
            .await
            .is_synced()
    }

    fn subscribe_snapshot(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.session.subscribe_snapshot()
    }

    fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.session.subscribe_status()
    }

    async fn infer(&self, request: InferenceRequest) -> GridResult<InferenceResponse> {
        let backend = &self.backend;
        let request = &request;
        self.invoke_inference(move || backend.invoke(request), &self.policy)
            .await
    }
}

impl core::fmt::Debug for DataProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataProvider")
            .field("principal", &self.principal())
            .field("session", &self.session)
            .field("governor", &self.governor)
            .finish_non_exhaustive()
    }
}

pub struct DataProviderBuilder {
    source: Arc<dyn SnapshotSource>,
    backend: Arc<dyn InferenceBackend>,
    recalibrator: Arc<dyn CredentialRecalibrator>,
    policy: RetryPolicy,
    quota_cooldown: Duration,
    principal: Option<Principal>,
}

impl DataProviderBuilder {
    pub fn with_recalibrator(mut self, recalibrator: Arc<dyn CredentialRecalibrator>) -> Self {
        self.recalibrator = recalibrator;
        self
    }

    /// Policy used by [`DataService::infer`].
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_quota_cooldown(mut self, cooldown: Duration) -> Self {
        self.quota_cooldown = cooldown;
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Take the retry policy and cooldown from `config`.
    pub fn with_config(self, config: &ProviderConfig) -> Self {
        self.with_retry_policy(config.retry.clone())
            .with_quota_cooldown(config.quota_cooldown)
    }

    pub fn build(self) -> DataProvider {
        let notices = Arc::new(NoticeBus::new());
        let governor = Arc::new(RateLimitGovernor::new(notices.clone()));
        let retrier = BackoffRetrier::new(governor.clone(), self.recalibrator, notices.clone())
            .with_quota_cooldown(self.quota_cooldown);

        DataProvider {
            session: SyncSession::new(self.source, notices.clone()),
            governor,
            retrier,
            backend: self.backend,
            policy: self.policy,
            principal: RwLock::new(self.principal),
            notices,
        }
    }
}
