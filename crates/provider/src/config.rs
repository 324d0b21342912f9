//! Provider configuration loaded from the environment.

use std::time::Duration;

use thiserror::Error;

use marketgrid_ai::{DEFAULT_COOLDOWN, MAX_COOLDOWN, RetryPolicy};
use marketgrid_core::{Principal, PrincipalId, Role};

pub const API_URL: &str = "MARKETGRID_API_URL";
pub const API_TOKEN: &str = "MARKETGRID_API_TOKEN";
pub const INFERENCE_URL: &str = "MARKETGRID_INFERENCE_URL";
pub const INFERENCE_KEY: &str = "MARKETGRID_INFERENCE_KEY";
pub const SYNC_INTERVAL_SECS: &str = "MARKETGRID_SYNC_INTERVAL_SECS";
pub const COOLDOWN_SECS: &str = "MARKETGRID_COOLDOWN_SECS";
pub const MAX_RETRIES: &str = "MARKETGRID_MAX_RETRIES";
pub const BASE_DELAY_MS: &str = "MARKETGRID_BASE_DELAY_MS";
pub const MAX_DELAY_MS: &str = "MARKETGRID_MAX_DELAY_MS";
pub const REQUEST_TIMEOUT_SECS: &str = "MARKETGRID_REQUEST_TIMEOUT_SECS";
pub const PRINCIPAL_ID: &str = "MARKETGRID_PRINCIPAL_ID";
pub const PRINCIPAL_ROLE: &str = "MARKETGRID_PRINCIPAL_ROLE";

/// Longest accepted refresh period.
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Everything the provider and its HTTP collaborators need.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Base URL of the marketplace API (no trailing slash).
    pub api_url: String,
    pub api_token: Option<String>,
    pub inference_url: String,
    pub inference_key: Option<String>,
    /// Period of the background refresh worker; `None` disables it.
    pub sync_interval: Option<Duration>,
    pub quota_cooldown: Duration,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            api_token: None,
            inference_url: "http://localhost:8090/v1/generate".to_string(),
            inference_key: None,
            sync_interval: None,
            quota_cooldown: DEFAULT_COOLDOWN,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or blank variables
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            get(var)
                .map(|value| {
                    value
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidNumber { var, value })
                })
                .transpose()
        };
        let seconds_at_most = |var: &'static str, secs: u64, max: Duration| {
            let value = Duration::from_secs(secs);
            if value > max {
                return Err(ConfigError::Invalid {
                    var,
                    reason: format!("must be at most {} seconds, got {secs}", max.as_secs()),
                });
            }
            Ok(value)
        };

        let mut config = Self::default();

        if let Some(url) = get(API_URL) {
            config = config.with_api_url(url);
        }
        config.api_token = get(API_TOKEN);
        if let Some(url) = get(INFERENCE_URL) {
            config = config.with_inference_url(url);
        }
        config.inference_key = get(INFERENCE_KEY);

        if let Some(secs) = number(SYNC_INTERVAL_SECS)? {
            let interval = seconds_at_most(SYNC_INTERVAL_SECS, secs, MAX_SYNC_INTERVAL)?;
            config.sync_interval = (secs > 0).then_some(interval);
        }
        if let Some(secs) = number(COOLDOWN_SECS)? {
            config.quota_cooldown = seconds_at_most(COOLDOWN_SECS, secs, MAX_COOLDOWN)?;
        }
        if let Some(retries) = number(MAX_RETRIES)? {
            config.retry.max_retries =
                u32::try_from(retries).map_err(|_| ConfigError::InvalidNumber {
                    var: MAX_RETRIES,
                    value: retries.to_string(),
                })?;
        }
        if let Some(ms) = number(BASE_DELAY_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = number(MAX_DELAY_MS)? {
            config.retry.max_delay = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(secs) = number(REQUEST_TIMEOUT_SECS)? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: REQUEST_TIMEOUT_SECS,
                    reason: "timeout must be at least one second".to_string(),
                });
            }
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_inference_url(mut self, url: impl Into<String>) -> Self {
        self.inference_url = url.into();
        self
    }

    pub fn with_inference_key(mut self, key: impl Into<String>) -> Self {
        self.inference_key = Some(key.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    pub fn with_quota_cooldown(mut self, cooldown: Duration) -> Self {
        self.quota_cooldown = cooldown;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// The principal the binary syncs for, if both variables are set.
pub fn principal_from_env() -> Result<Option<Principal>, ConfigError> {
    principal_from_lookup(|var| std::env::var(var).ok())
}

pub fn principal_from_lookup<F>(lookup: F) -> Result<Option<Principal>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(id) = lookup(PRINCIPAL_ID).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };

    let id = id
        .trim()
        .parse::<PrincipalId>()
        .map_err(|e| ConfigError::Invalid {
            var: PRINCIPAL_ID,
            reason: e.to_string(),
        })?;

    let role = match lookup(PRINCIPAL_ROLE) {
        Some(role) => role.parse::<Role>().map_err(|reason| ConfigError::Invalid {
            var: PRINCIPAL_ROLE,
            reason,
        })?,
        None => {
            return Err(ConfigError::Invalid {
                var: PRINCIPAL_ROLE,
                reason: format!("required when {PRINCIPAL_ID} is set"),
            });
        }
    };

    Ok(Some(Principal::new(id, role)))
}
