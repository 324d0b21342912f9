//! `marketgrid-ai`
//!
//! **Responsibility:** resilient access to the external inference service.
//!
//! - [`RateLimitGovernor`] refuses calls locally while a quota cooldown runs.
//! - [`BackoffRetrier`] retries transient failures with exponential backoff
//!   and turns quota / credential failures into typed outcomes.
//!
//! The two compose at the call site: `governor.guard(|| retrier.execute(..))`,
//! so the saturation check happens before the first attempt.

pub mod backend;
pub mod governor;
pub mod retry;

pub use backend::{
    CredentialRecalibrator, InferenceBackend, InferenceRequest, InferenceResponse,
    NoopRecalibrator, ScriptedBackend,
};
pub use governor::{DEFAULT_COOLDOWN, MAX_COOLDOWN, RateLimitGovernor, RateLimitState};
pub use retry::{BackoffRetrier, RetryAttempt, RetryPolicy};
pub use tokio_util::sync::CancellationToken;
