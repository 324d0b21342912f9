//! HTTP collaborators: snapshot API, inference API, credential reload.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::StatusCode;

use marketgrid_ai::{CredentialRecalibrator, InferenceBackend, InferenceRequest, InferenceResponse};
use marketgrid_core::{InferenceFailure, Principal, RawSnapshot};
use marketgrid_sync::{FetchError, SnapshotSource};

use crate::config::{self, ProviderConfig};
use crate::provider::DataProvider;

/// Fetches snapshots from `GET {api_url}/principals/{id}/snapshot?role={role}`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpSnapshotSource {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn snapshot_url(&self, principal: &Principal) -> String {
        format!("{}/principals/{}/snapshot", self.api_url, principal.id())
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self, principal: &Principal) -> Result<RawSnapshot, FetchError> {
        let mut req = self
            .client
            .get(self.snapshot_url(principal))
            .query(&[("role", principal.role().as_str())]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_connect() {
                FetchError::Offline
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(FetchError::Unauthorized(error_text));
        }
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(FetchError::Api(status.as_u16(), error_text));
        }

        resp.json::<RawSnapshot>()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }
}

/// The inference key, shared between the backend that sends it and the
/// recalibrator that replaces it.
#[derive(Debug, Clone, Default)]
pub struct CredentialSlot(Arc<RwLock<Option<String>>>);

impl CredentialSlot {
    pub fn new(key: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(key)))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, key: Option<String>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = key;
    }
}

/// Calls `POST {url}` with an [`InferenceRequest`] body.
///
/// Wire statuses are classified here: 429 is rate limiting, 401/403/404 a
/// stale credential; other failures fall back to message classification.
#[derive(Debug, Clone)]
pub struct HttpInferenceBackend {
    client: reqwest::Client,
    url: String,
    credential: CredentialSlot,
}

impl HttpInferenceBackend {
    pub fn new(client: reqwest::Client, url: impl Into<String>, credential: CredentialSlot) -> Self {
        Self {
            client,
            url: url.into(),
            credential,
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceBackend {
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceFailure> {
        let mut req = self.client.post(&self.url).json(request);
        if let Some(key) = self.credential.get() {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| InferenceFailure::other(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<InferenceResponse>()
                .await
                .map_err(|e| InferenceFailure::other(format!("malformed inference response: {e}")));
        }

        let error_text = resp.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, error_text);
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => InferenceFailure::rate_limited(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                InferenceFailure::invalid_credential(message)
            }
            _ => InferenceFailure::from_message(message),
        })
    }
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Re-reads the inference key from `MARKETGRID_INFERENCE_KEY`.
pub struct EnvCredentialRecalibrator {
    slot: CredentialSlot,
    lookup: Lookup,
}

impl EnvCredentialRecalibrator {
    pub fn new(slot: CredentialSlot) -> Self {
        Self::with_lookup(slot, |var| std::env::var(var).ok())
    }

    pub fn with_lookup<F>(slot: CredentialSlot, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            slot,
            lookup: Box::new(lookup),
        }
    }
}

#[async_trait]
impl CredentialRecalibrator for EnvCredentialRecalibrator {
    async fn recalibrate(&self) {
        let fresh = (self.lookup)(config::INFERENCE_KEY).filter(|k| !k.trim().is_empty());
        match fresh {
            Some(key) if Some(&key) != self.slot.get().as_ref() => {
                self.slot.set(Some(key));
                tracing::info!("inference credential reloaded");
            }
            Some(_) => tracing::warn!(
                var = config::INFERENCE_KEY,
                "inference credential unchanged; replace the key to recover"
            ),
            None => tracing::warn!(var = config::INFERENCE_KEY, "no inference credential configured"),
        }
    }
}

impl core::fmt::Debug for EnvCredentialRecalibrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EnvCredentialRecalibrator").finish_non_exhaustive()
    }
}

/// Wire a provider to the HTTP collaborators described by `config`.
pub fn build_provider(config: &ProviderConfig) -> Result<DataProvider, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;

    let credential = CredentialSlot::new(config.inference_key.clone());
    let source = HttpSnapshotSource::new(client.clone(), &config.api_url, config.api_token.clone());
    let backend = HttpInferenceBackend::new(client, &config.inference_url, credential.clone());

    Ok(DataProvider::builder(Arc::new(source), Arc::new(backend))
        .with_recalibrator(Arc::new(EnvCredentialRecalibrator::new(credential)))
        .with_config(config)
        .build())
}
