//! Engine configuration loaded from environment variables.

use std::time::Duration;

use crate::retry::RetryPolicy;

const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 300;

/// Saga engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_APPLICATION_ID`: identity stamped on outgoing messages and step records (default: `"saga-engine"`)
/// - `SAGA_RETRY_MAX_ATTEMPTS`: total handler attempts for transient failures (default: `3`)
/// - `SAGA_RETRY_BASE_DELAY_MS`: first backoff delay (default: `100`)
/// - `SAGA_RETRY_MAX_DELAY_MS`: backoff cap (default: `5000`)
/// - `SAGA_RETRY_JITTER`: randomize backoff delays (default: `true`)
/// - `SAGA_CLAIM_TIMEOUT_MS`: age after which a `Started` step left by a crashed dispatch may be reclaimed (default: `300000`)
/// - `SAGA_COMPENSATE_ON_FAILURE`: run compensation when a handler fails (default: `true`)
#[derive(Debug, Clone)]
pub struct SagaConfig {
    pub application_id: String,
    pub retry: RetryPolicy,
    pub compensate_on_failure: bool,
    pub claim_timeout: Duration,
}

impl SagaConfig {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy::new(
            env_parse("SAGA_RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
            env_parse("SAGA_RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            env_parse("SAGA_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        )
        .with_jitter(env_parse("SAGA_RETRY_JITTER").unwrap_or(defaults.retry.jitter));

        Self {
            application_id: std::env::var("SAGA_APPLICATION_ID")
                .unwrap_or(defaults.application_id),
            retry,
            compensate_on_failure: env_parse("SAGA_COMPENSATE_ON_FAILURE")
                .unwrap_or(defaults.compensate_on_failure),
            claim_timeout: env_parse("SAGA_CLAIM_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.claim_timeout),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compensate_on_failure(mut self, enabled: bool) -> Self {
        self.compensate_on_failure = enabled;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            application_id: "saga-engine".to_string(),
            retry: RetryPolicy::default(),
            compensate_on_failure: true,
            claim_timeout: Duration::from_secs(DEFAULT_CLAIM_TIMEOUT_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
