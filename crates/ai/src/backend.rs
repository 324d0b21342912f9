//! Seams to the inference grid and to credential reloading.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketgrid_core::{InferenceFailure, PrincipalId};

/// One call to the external inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Logical task name (e.g. `"briefing-generation"`).
    pub task: String,
    pub prompt: String,
    /// Structured context attached to the prompt.
    #[serde(default)]
    pub context: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<PrincipalId>,
}

impl InferenceRequest {
    pub fn new(task: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            prompt: prompt.into(),
            context: JsonValue::Null,
            principal: None,
        }
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }

    pub fn for_principal(mut self, principal: PrincipalId) -> Self {
        self.principal = Some(principal);
        self
    }
}

/// Result of an inference call.
///
/// This is an *insight* for display, never applied to snapshot state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,

    /// Free-form metadata (model name, token counts, timings, …).
    #[serde(default)]
    pub metadata: JsonValue,
}

impl InferenceResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The external inference collaborator.
///
/// Implementations classify failures at the boundary where the wire status is
/// known and report them as [`InferenceFailure`].
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceFailure>;
}

/// Re-establishes the credential used by an [`InferenceBackend`].
///
/// Invoked once per stale-credential failure. Failures are the
/// implementation's to log; the caller has already reported the error.
#[async_trait]
pub trait CredentialRecalibrator: Send + Sync {
    async fn recalibrate(&self);
}

/// Recalibrator for hosts that cannot refresh credentials; only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecalibrator;

#[async_trait]
impl CredentialRecalibrator for NoopRecalibrator {
    async fn recalibrate(&self) {
        tracing::warn!("inference credential is stale and no recalibrator is configured");
    }
}

/// Backend that replays scripted results, for tests/dev.
///
/// Once the script runs out, the last entry repeats.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<InferenceResponse, InferenceFailure>>>,
    last: Mutex<Option<Result<InferenceResponse, InferenceFailure>>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = Result<InferenceResponse, InferenceFailure>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers with `text`.
    pub fn answering(text: impl Into<String>) -> Self {
        Self::new([Ok(InferenceResponse::new(text))])
    }

    /// Always fails with `failure`.
    pub fn failing(failure: InferenceFailure) -> Self {
        Self::new([Err(failure)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn invoke(&self, _request: &InferenceRequest) -> Result<InferenceResponse, InferenceFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);

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
            .unwrap_or_else(|| Err(InferenceFailure::other("scripted backend has no script")))
    }
}
