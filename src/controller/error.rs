//! Error types shared by every controller
//!
//! Errors are classified once, where they are created. The reconcilers only
//! look at the classification to decide between backing off and waiting for
//! the next spec change; they never re-classify.

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `PermanentError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Throttled (will retry): {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{reason}: {message}")]
    PermanentError { reason: String, message: String },

    #[error("storage backend is not configured")]
    StorageNotConfigured,

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Wait hint for a 429 from the API server
///
/// kube-apiserver rejects overload with `Retry-After: 1`; `kube::Error`
/// does not carry the header through, so the value is fixed here.
pub const API_SERVER_RETRY_AFTER: Duration = Duration::from_secs(1);

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == 429 || resp.reason == "TooManyRequests" => {
                Error::Throttled {
                    message: resp.message,
                    retry_after: Some(API_SERVER_RETRY_AFTER),
                }
            }
            other => Error::KubeError(other),
        }
    }
}

impl Error {
    pub fn permanent(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PermanentError {
            reason: reason.into(),
            message: message.into(),
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || self.api_code() == Some(404)
    }

    /// Optimistic-concurrency mismatch
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_)) || self.api_code() == Some(409)
    }

    /// Object already exists; happens when a create races another writer
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Configuration defects that no amount of retrying fixes
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::PermanentError { .. } | Error::InvalidConfig(_) | Error::StorageNotConfigured
        )
    }

    /// Infrastructure flakiness: timeouts, throttling, server errors, dropped connections
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientError(_) | Error::Throttled { .. } => true,
            Error::KubeError(kube::Error::Api(resp)) => {
                matches!(resp.code, 429 | 500 | 502 | 503 | 504)
            }
            Error::KubeError(e) => {
                matches!(e, kube::Error::HyperError(_) | kube::Error::Service(_))
            }
            _ => false,
        }
    }

    /// Server-provided wait hint, if any
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Error::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Reason string reported on conditions
    pub fn reason(&self) -> String {
        match self {
            Error::PermanentError { reason, .. } => reason.clone(),
            Error::InvalidConfig(_) => "InvalidConfiguration".to_string(),
            Error::StorageNotConfigured => "StorageNotConfigured".to_string(),
            Error::Timeout(_) => "Timeout".to_string(),
            _ => "Error".to_string(),
        }
    }

    /// Message reported on conditions
    pub fn message(&self) -> String {
        match self {
            Error::PermanentError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the work queue should back off and retry
    pub fn is_retryable(&self) -> bool {
        !self.is_permanent() && !matches!(self, Error::Cancelled)
    }
}

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Short backoff used between optimistic-concurrency retries
    pub fn conflict() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}
