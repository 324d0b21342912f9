//! User-facing notices raised by sync and inference.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use marketgrid_core::PrincipalId;

use crate::bus::EventBus;
use crate::in_memory_bus::InMemoryEventBus;

/// A transient, user-visible notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// A snapshot refresh failed; the previous snapshot is still served.
    SyncStalled {
        principal: PrincipalId,
        error: String,
        at: DateTime<Utc>,
    },
    /// The inference quota ran out; calls are refused until the cooldown ends.
    SaturationArmed { cooldown: Duration, at: DateTime<Utc> },
    /// A call was refused locally because the governor is saturated.
    InferenceRefused { retry_in: Duration, at: DateTime<Utc> },
    /// The inference credential went stale and is being re-established.
    CredentialRecalibrating { reason: String, at: DateTime<Utc> },
}

impl Notice {
    pub fn sync_stalled(principal: PrincipalId, error: impl Into<String>) -> Self {
        Self::SyncStalled {
            principal,
            error: error.into(),
            at: Utc::now(),
        }
    }

    pub fn saturation_armed(cooldown: Duration) -> Self {
        Self::SaturationArmed {
            cooldown,
            at: Utc::now(),
        }
    }

    pub fn inference_refused(retry_in: Duration) -> Self {
        Self::InferenceRefused {
            retry_in,
            at: Utc::now(),
        }
    }

    pub fn credential_recalibrating(reason: impl Into<String>) -> Self {
        Self::CredentialRecalibrating {
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    /// Short text suitable for a toast.
    pub fn message(&self) -> String {
        match self {
            Notice::SyncStalled { .. } => "Sync stalled; using local buffer".to_string(),
            Notice::SaturationArmed { cooldown, .. } => {
                format!("Inference quota reached; pausing for {}s", cooldown.as_secs())
            }
            Notice::InferenceRefused { retry_in, .. } => {
                format!("Inference grid saturated; try again in {}s", retry_in.as_secs().max(1))
            }
            Notice::CredentialRecalibrating { .. } => {
                "Inference credential expired; please re-select a key".to_string()
            }
        }
    }
}

/// Sink for notices.
///
/// Components hold an `Arc<dyn Notifier>` so tests and hosts can swap the
/// transport.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// The bus the provider publishes notices on.
pub type NoticeBus = InMemoryEventBus<Notice>;

impl Notifier for InMemoryEventBus<Notice> {
    fn notify(&self, notice: Notice) {
        tracing::info!(notice = %notice.message(), "notice");
        if let Err(e) = self.publish(notice) {
            tracing::warn!(error = ?e, "failed to publish notice");
        }
    }
}

/// Discards every notice.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notice: Notice) {}
}
