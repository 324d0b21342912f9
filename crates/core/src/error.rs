//! Error taxonomy of the sync & inference layer.

use std::time::Duration;

use thiserror::Error;

/// Result type used across the orchestration layer.
pub type GridResult<T> = Result<T, GridError>;

/// Typed failure reported by the inference collaborator.
///
/// Classification belongs to the boundary that sees the wire-level status;
/// [`InferenceFailure::from_message`] exists for collaborators that can only
/// hand back prose.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceFailure {
    /// HTTP 429 or an explicit quota message.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The remote principal/key is no longer valid.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Anything else; treated as transient.
    #[error("{0}")]
    Other(String),
}

impl InferenceFailure {
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn invalid_credential(msg: impl Into<String>) -> Self {
        Self::InvalidCredential(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Classify an untyped error message.
    ///
    /// `"429"` or `"quota"` means rate limited; `"requested entity was not
    /// found"` means the credential went stale. Matching is case-insensitive.
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("429") || lower.contains("quota") {
            Self::RateLimited(msg)
        } else if lower.contains("requested entity was not found") {
            Self::InvalidCredential(msg)
        } else {
            Self::Other(msg)
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::RateLimited(m) | Self::InvalidCredential(m) | Self::Other(m) => m,
        }
    }
}

/// Typed outcome of a failed orchestration call.
///
/// Lock and status bookkeeping cannot fail, so nothing here describes them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    /// The governor is in cooldown; the call was refused locally.
    #[error("inference grid saturated; retry in {retry_in:?}")]
    GridSaturated { retry_in: Duration },

    /// The remote reported 429/quota; a cooldown has been armed.
    #[error("inference quota exhausted ({message}); cooling down for {cooldown:?}")]
    QuotaExhausted { message: String, cooldown: Duration },

    /// The remote credential is stale; recalibration has been triggered.
    #[error("inference credential invalid: {0}")]
    CredentialInvalid(String),

    /// A transient failure that survived every retry.
    #[error("inference failed after {attempts} attempt(s): {last}")]
    TransientFailure { attempts: u32, last: InferenceFailure },

    /// Snapshot fetch failed; the previous snapshot is still served.
    #[error("snapshot sync failed: {0}")]
    SyncFailure(String),

    /// The caller abandoned the call.
    #[error("operation cancelled")]
    Cancelled,
}

impl GridError {
    pub fn sync_failure(msg: impl Into<String>) -> Self {
        Self::SyncFailure(msg.into())
    }

    /// True for both flavours of rate-limit refusal.
    pub fn is_saturation(&self) -> bool {
        matches!(self, Self::GridSaturated { .. } | Self::QuotaExhausted { .. })
    }

    /// The collaborator failure a transient error ended on, if any.
    pub fn last_failure(&self) -> Option<&InferenceFailure> {
        match self {
            Self::TransientFailure { last, .. } => Some(last),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_quota_messages() {
        assert_eq!(
            InferenceFailure::from_message("Error: 429 quota exceeded"),
            InferenceFailure::rate_limited("Error: 429 quota exceeded")
        );
        assert!(matches!(
            InferenceFailure::from_message("Resource has been exhausted (e.g. check QUOTA)."),
            InferenceFailure::RateLimited(_)
        ));
    }

    #[test]
    fn classifies_stale_credentials() {
        assert!(matches!(
            InferenceFailure::from_message("Requested entity was not found."),
            InferenceFailure::InvalidCredential(_)
        ));
    }

    #[test]
    fn everything_else_is_transient() {
        let failure = InferenceFailure::from_message("connection reset by peer");
        assert_eq!(failure, InferenceFailure::other("connection reset by peer"));
        assert_eq!(failure.message(), "connection reset by peer");
    }

    #[test]
    fn saturation_class_covers_both_refusals() {
        assert!(GridError::GridSaturated { retry_in: Duration::from_secs(1) }.is_saturation());
        assert!(
            GridError::QuotaExhausted {
                message: "429".into(),
                cooldown: Duration::from_secs(60)
            }
            .is_saturation()
        );
        assert!(!GridError::Cancelled.is_saturation());
    }

    #[test]
    fn transient_failure_exposes_original_error() {
        let err = GridError::TransientFailure {
            attempts: 4,
            last: InferenceFailure::other("boom"),
        };
        assert_eq!(err.last_failure(), Some(&InferenceFailure::other("boom")));
        assert!(err.to_string().contains("4 attempt"));
    }
}
