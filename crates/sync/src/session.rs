//! One full-snapshot refresh cycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use marketgrid_core::{GridError, Principal, Snapshot};
use marketgrid_events::{Notice, Notifier};

use crate::lock::{FULL_SYNC, RequestGuard, RequestLock};
use crate::source::SnapshotSource;
use crate::status::{StatusMachine, SyncStatus};

/// Who asked for the refresh.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefreshMode {
    /// Startup, timers, reconnects. Dropped if a sync is already running.
    Automatic,
    /// An explicit user retry. Clears a stuck lock and always runs.
    Manual,
}

impl RefreshMode {
    pub fn from_manual(manual: bool) -> Self {
        if manual {
            RefreshMode::Manual
        } else {
            RefreshMode::Automatic
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No authenticated principal to sync for.
    NoPrincipal,
    /// Another refresh holds the lock.
    InFlight,
    /// The principal changed while fetching; the result was dropped.
    Superseded,
}

/// What a call to [`SyncSession::refresh`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced { records: usize, elapsed: Duration },
    Skipped(SkipReason),
    /// The fetch failed; the previous snapshot is still served.
    Stalled(GridError),
}

impl SyncOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. })
    }

    pub fn error(&self) -> Option<&GridError> {
        match self {
            SyncOutcome::Stalled(err) => Some(err),
            _ => None,
        }
    }
}

/// Counters over the session's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub cycles_completed: u64,
    pub failures: u64,
    /// Automatic refreshes dropped because one was already in flight.
    pub coalesced: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Pulls snapshots from a [`SnapshotSource`] and publishes them.
///
/// The snapshot lives in a `watch` channel holding an `Arc`: publishing is a
/// single swap, readers clone the `Arc` and never see a half-applied sync.
pub struct SyncSession {
    source: Arc<dyn SnapshotSource>,
    lock: RequestLock,
    status: StatusMachine,
    snapshot: watch::Sender<Arc<Snapshot>>,
    stats: Mutex<SyncStats>,
    notifier: Arc<dyn Notifier>,
    // Bumped on every principal switch. Held while publishing so a switch
    // cannot interleave with the check.
    epoch: Mutex<u64>,
}

impl SyncSession {
    pub fn new(source: Arc<dyn SnapshotSource>, notifier: Arc<dyn Notifier>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::empty()));
        Self {
            source,
            lock: RequestLock::new(),
            status: StatusMachine::new(),
            snapshot,
            stats: Mutex::new(SyncStats::default()),
            notifier,
            epoch: Mutex::new(0),
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        lock(&self.stats).clone()
    }

    /// Number of principal switches so far. Pass it to
    /// [`refresh_in`](Self::refresh_in) together with the principal read at
    /// the same time.
    pub fn epoch(&self) -> u64 {
        *lock(&self.epoch)
    }

    /// Forget everything synced for the previous principal.
    ///
    /// Discards the snapshot, marks the session `Syncing` again and frees
    /// [`FULL_SYNC`] so the next automatic refresh is not coalesced into a
    /// fetch for the old principal. Fetches still in flight finish as
    /// [`SkipReason::Superseded`] without publishing.
    pub fn switch_principal(&self) {
        let mut epoch = lock(&self.epoch);
        *epoch = epoch.wrapping_add(1);
        self.lock.release(FULL_SYNC);
        self.snapshot.send_replace(Arc::new(Snapshot::empty()));
        self.status.begin();
        debug!(epoch = *epoch, "principal switched; snapshot discarded");
    }

    /// The lock guarding [`FULL_SYNC`].
    pub fn request_lock(&self) -> &RequestLock {
        &self.lock
    }

    /// Run one refresh for `principal`.
    ///
    /// Never fails: fetch errors become [`SyncOutcome::Stalled`] and are not
    /// retried here. The lock is released on every path, including when the
    /// returned future is dropped mid-fetch; in that case the status it
    /// replaced is put back.
    pub async fn refresh(&self, principal: Option<&Principal>, mode: RefreshMode) -> SyncOutcome {
        self.refresh_in(principal, self.epoch(), mode).await
    }

    /// [`refresh`](Self::refresh) for a principal read during `epoch`.
    ///
    /// Returns [`SkipReason::Superseded`] without publishing if a
    /// [`switch_principal`](Self::switch_principal) happens before the
    /// result is in.
    pub async fn refresh_in(
        &self,
        principal: Option<&Principal>,
        epoch: u64,
        mode: RefreshMode,
    ) -> SyncOutcome {
        let Some(principal) = principal else {
            debug!("no principal; skipping refresh");
            return SyncOutcome::Skipped(SkipReason::NoPrincipal);
        };

        let guard = match mode {
            RefreshMode::Automatic => match self.lock.try_lock(FULL_SYNC) {
                Some(guard) => guard,
                None => {
                    lock(&self.stats).coalesced += 1;
                    debug!(%principal, "refresh already in flight; coalesced");
                    return SyncOutcome::Skipped(SkipReason::InFlight);
                }
            },
            RefreshMode::Manual => self.lock.force_lock(FULL_SYNC),
        };

        if self.current_epoch(epoch).is_none() {
            debug!(%principal, "principal switched before the fetch; skipping");
            return SyncOutcome::Skipped(SkipReason::Superseded);
        }
        let mut in_flight = InFlight {
            guard,
            status: &self.status,
            previous: self.status.begin(),
            settled: false,
        };
        let started = Instant::now();

        let fetched = self.source.fetch_snapshot(principal).await;
        in_flight.settled = true;

        match fetched {
            Ok(raw) => {
                let fetched_at = Utc::now();
                let snapshot = Snapshot::normalize(&raw).with_origin(principal.id(), fetched_at);
                let records = snapshot.total_records();

                {
                    let Some(_current) = self.current_epoch(epoch) else {
                        debug!(%principal, "principal switched mid-fetch; dropping snapshot");
                        return SyncOutcome::Skipped(SkipReason::Superseded);
                    };
                    self.snapshot.send_replace(Arc::new(snapshot));
                    self.status.succeed();
                }

                let elapsed = started.elapsed();
                {
                    let mut stats = lock(&self.stats);
                    stats.cycles_completed += 1;
                    stats.last_synced_at = Some(fetched_at);
                    stats.last_error = None;
                }

                info!(
                    %principal,
                    records,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "snapshot sync complete"
                );
                SyncOutcome::Synced { records, elapsed }
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let Some(_current) = self.current_epoch(epoch) else {
                        debug!(%principal, error = %message, "principal switched mid-fetch; ignoring failure");
                        return SyncOutcome::Skipped(SkipReason::Superseded);
                    };
                    self.status.stall();
                }
                {
                    let mut stats = lock(&self.stats);
                    stats.failures += 1;
                    stats.last_error = Some(message.clone());
                }

                warn!(%principal, error = %message, "snapshot sync failed; serving previous snapshot");
                self.notifier
                    .notify(Notice::sync_stalled(principal.id(), message.clone()));
                SyncOutcome::Stalled(GridError::sync_failure(message))
            }
        }
    }

    /// The epoch lock, if no switch happened since `epoch` was read.
    fn current_epoch(&self, epoch: u64) -> Option<MutexGuard<'_, u64>> {
        let current = lock(&self.epoch);
        (*current == epoch).then_some(current)
    }
}

/// One running refresh: owns the lock and, if dropped before the fetch
/// returns, puts back the status it replaced.
struct InFlight<'a> {
    guard: RequestGuard<'a>,
    status: &'a StatusMachine,
    previous: SyncStatus,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // A newer refresh or a principal switch owns the status now.
        if !self.settled && self.guard.is_current() {
            debug!(status = %self.previous, "refresh abandoned mid-fetch");
            self.status.restore(self.previous);
        }
    }
}

impl core::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncSession")
            .field("status", &self.status())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FetchError, InMemorySnapshotSource};
    use marketgrid_core::{Collection, PrincipalId, Role};
    use marketgrid_events::{EventBus, NoticeBus, NullNotifier};
    use serde_json::json;

    fn principal() -> Principal {
        Principal::new(PrincipalId::new(), Role::Supplier)
    }

    fn session(source: Arc<InMemorySnapshotSource>) -> SyncSession {
        SyncSession::new(source, Arc::new(NullNotifier))
    }

    #[tokio::test]
    async fn normalizes_and_publishes() {
        let source = Arc::new(InMemorySnapshotSource::serving(json!({
            "orders": [{"id": "o1"}],
            "products": null,
        })));
        let session = session(source);
        let p = principal();

        let outcome = session.refresh(Some(&p), RefreshMode::Automatic).await;

        assert!(matches!(outcome, SyncOutcome::Synced { records: 1, .. }));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.get(Collection::Orders), &[json!({"id": "o1"})]);
        assert!(snapshot.get(Collection::Products).is_empty());
        assert_eq!(snapshot.principal(), Some(p.id()));
        assert_eq!(session.status(), SyncStatus::Nominal);
        assert!(session.stats().last_synced_at.is_some());
        assert!(!session.request_lock().is_held(FULL_SYNC));
    }

    #[tokio::test]
    async fn missing_principal_is_a_no_op() {
        let source = Arc::new(InMemorySnapshotSource::serving(json!({})));
        let session = session(source.clone());

        let outcome = session.refresh(None, RefreshMode::Manual).await;

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::NoPrincipal));
        assert_eq!(source.calls(), 0);
        assert_eq!(session.status(), SyncStatus::Syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_automatic_refreshes_coalesce() {
        let source = Arc::new(
            InMemorySnapshotSource::serving(json!({"orders": []}))
                .with_latency(Duration::from_secs(1)),
        );
        let session = session(source.clone());
        let p = principal();

        let (first, second, third) = tokio::join!(
            session.refresh(Some(&p), RefreshMode::Automatic),
            session.refresh(Some(&p), RefreshMode::Automatic),
            session.refresh(Some(&p), RefreshMode::Automatic),
        );

        assert!(first.is_synced());
        assert_eq!(second, SyncOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(third, SyncOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(source.calls(), 1);
        assert_eq!(session.stats().coalesced, 2);
    }

    #[tokio::test]
    async fn manual_refresh_overrides_a_stuck_lock() {
        let source = Arc::new(InMemorySnapshotSource::serving(json!({})));
        let session = session(source.clone());
        let p = principal();
        assert!(session.request_lock().try_acquire(FULL_SYNC));

        let skipped = session.refresh(Some(&p), RefreshMode::Automatic).await;
        assert_eq!(skipped, SyncOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(source.calls(), 0);

        let outcome = session.refresh(Some(&p), RefreshMode::Manual).await;
        assert!(outcome.is_synced());
        assert_eq!(source.calls(), 1);
        assert!(!session.request_lock().is_held(FULL_SYNC));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_runs_during_an_in_flight_sync() {
        let source = Arc::new(
            InMemorySnapshotSource::serving(json!({})).with_latency(Duration::from_secs(1)),
        );
        let session = session(source.clone());
        let p = principal();

        let (automatic, manual) = tokio::join!(
            session.refresh(Some(&p), RefreshMode::Automatic),
            session.refresh(Some(&p), RefreshMode::Manual),
        );

        assert!(automatic.is_synced());
        assert!(manual.is_synced());
        assert_eq!(source.calls(), 2);
        assert!(!session.request_lock().is_held(FULL_SYNC));
    }

    #[tokio::test]
    async fn failure_keeps_previous_snapshot() {
        let source = Arc::new(InMemorySnapshotSource::new([
            Ok(json!({"orders": [{"id": "o1"}]})),
            Err(FetchError::Network("connection reset".to_string())),
        ]));
        let bus = Arc::new(NoticeBus::new());
        let notices = bus.subscribe();
        let session = SyncSession::new(source, bus.clone());
        let p = principal();

        session.refresh(Some(&p), RefreshMode::Automatic).await;
        let before = session.snapshot();

        let outcome = session.refresh(Some(&p), RefreshMode::Manual).await;

        assert_eq!(
            outcome.error(),
            Some(&GridError::sync_failure("network error: connection reset"))
        );
        assert!(Arc::ptr_eq(&before, &session.snapshot()));
        assert_eq!(session.status(), SyncStatus::Stalled);

        let stats = session.stats();
        assert_eq!((stats.cycles_completed, stats.failures), (1, 1));
        assert_eq!(stats.last_error.as_deref(), Some("network error: connection reset"));

        let notices = notices.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message(), "Sync stalled; using local buffer");
    }

    #[tokio::test]
    async fn subscribers_receive_each_published_snapshot() {
        let source = Arc::new(InMemorySnapshotSource::serving(json!({"quotes": [1, 2]})));
        let session = session(source);
        let mut rx = session.subscribe_snapshot();

        session.refresh(Some(&principal()), RefreshMode::Automatic).await;

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().get(Collection::Quotes).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn principal_switch_drops_the_in_flight_result() {
        let source = Arc::new(
            InMemorySnapshotSource::serving(json!({"orders": [{"id": "o1"}]}))
                .with_latency(Duration::from_secs(1)),
        );
        let session = session(source.clone());
        let (old, new) = (principal(), principal());

        let (stale, fresh) = tokio::join!(
            session.refresh(Some(&old), RefreshMode::Automatic),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.switch_principal();
                assert!(session.snapshot().is_empty());
                assert!(!session.request_lock().is_held(FULL_SYNC));
                session.refresh(Some(&new), RefreshMode::Automatic).await
            },
        );

        assert_eq!(stale, SyncOutcome::Skipped(SkipReason::Superseded));
        assert!(fresh.is_synced());
        assert_eq!(source.calls(), 2);
        assert_eq!(session.snapshot().principal(), Some(new.id()));
        assert_eq!(session.status(), SyncStatus::Nominal);
        assert_eq!(session.stats().cycles_completed, 1);
        assert!(!session.request_lock().is_held(FULL_SYNC));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failure_after_a_switch_raises_no_notice() {
        let source = Arc::new(
            InMemorySnapshotSource::failing(FetchError::Offline).with_latency(Duration::from_secs(1)),
        );
        let bus = Arc::new(NoticeBus::new());
        let notices = bus.subscribe();
        let session = SyncSession::new(source, bus.clone());

        let who = principal();
        let (outcome, ()) = tokio::join!(
            session.refresh(Some(&who), RefreshMode::Automatic),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.switch_principal();
            },
        );

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Superseded));
        assert_eq!(session.status(), SyncStatus::Syncing);
        assert_eq!(session.stats().failures, 0);
        assert!(notices.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_refresh_restores_the_previous_status() {
        let source = Arc::new(
            InMemorySnapshotSource::serving(json!({"orders": [{"id": "o1"}]}))
                .with_latency(Duration::from_secs(1)),
        );
        let session = session(source);
        let p = principal();
        assert!(session.refresh(Some(&p), RefreshMode::Automatic).await.is_synced());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            session.refresh(Some(&p), RefreshMode::Manual),
        )
        .await;

        assert!(abandoned.is_err());
        assert_eq!(session.status(), SyncStatus::Nominal);
        assert!(!session.request_lock().is_held(FULL_SYNC));
    }

    #[tokio::test]
    async fn refresh_from_a_past_epoch_never_fetches() {
        let source = Arc::new(InMemorySnapshotSource::serving(json!({"orders": [{"id": "o1"}]})));
        let session = session(source.clone());
        let epoch = session.epoch();

        session.switch_principal();
        let outcome = session
            .refresh_in(Some(&principal()), epoch, RefreshMode::Manual)
            .await;

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Superseded));
        assert_eq!(source.calls(), 0);
        assert_eq!(session.epoch(), epoch + 1);
    }

    #[test]
    fn refresh_mode_from_flag() {
        assert_eq!(RefreshMode::from_manual(true), RefreshMode::Manual);
        assert_eq!(RefreshMode::from_manual(false), RefreshMode::Automatic);
    }
}
