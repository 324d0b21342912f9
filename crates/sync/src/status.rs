//! Observable health of the published snapshot.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Health of the snapshot.
///
/// `Stalled` means the last refresh failed: the previous snapshot is still
/// served and a refresh is recommended. It never means "no data".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Syncing,
    Nominal,
    Stalled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Syncing => "syncing",
            SyncStatus::Nominal => "nominal",
            SyncStatus::Stalled => "stalled",
        }
    }

    /// Whether a refresh is in flight (UI disables its refresh action).
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncStatus::Syncing)
    }
}

impl core::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable [`SyncStatus`], written only by the sync session.
#[derive(Debug)]
pub struct StatusMachine {
    tx: watch::Sender<SyncStatus>,
}

impl StatusMachine {
    /// Starts as `Syncing`: the provider kicks off a refresh at startup.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::Syncing);
        Self { tx }
    }

    pub fn current(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Enter `Syncing`, returning the status it replaced.
    pub(crate) fn begin(&self) -> SyncStatus {
        self.transition(SyncStatus::Syncing)
    }

    pub(crate) fn succeed(&self) {
        self.transition(SyncStatus::Nominal);
    }

    pub(crate) fn stall(&self) {
        self.transition(SyncStatus::Stalled);
    }

    /// Put back a status saved by [`begin`](Self::begin) when a refresh ends
    /// without a result.
    pub(crate) fn restore(&self, to: SyncStatus) {
        self.transition(to);
    }

    fn transition(&self, to: SyncStatus) -> SyncStatus {
        let from = self.tx.send_replace(to);
        if from != to {
            tracing::debug!(%from, %to, "sync status changed");
        }
        from
    }
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}
