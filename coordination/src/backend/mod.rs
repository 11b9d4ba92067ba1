//! Text-generation backend capability and failure classification.
//!
//! A [`Backend`] is any remote (or local) model endpoint that turns a prompt
//! into text. Adapters report failures as [`BackendError`]; the router only
//! ever looks at the coarse [`FailureKind`] when updating health.
//!
//! ## Failure classes
//!
//! | Kind          | Source                         | Effect on health              |
//! |---------------|--------------------------------|-------------------------------|
//! | `AuthFailure` | HTTP 401/403, missing key      | disabled until reconfigured   |
//! | `RateLimit`   | HTTP 429                       | skipped for the short window  |
//! | `Generic`     | everything else, incl. timeout | counted toward the threshold  |

pub mod health;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use health::{BackendHealth, HealthPolicy, HealthSnapshot};

/// Coarse failure class used by the health tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AuthFailure,
    RateLimit,
    Generic,
}

impl FailureKind {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthFailure,
            429 => Self::RateLimit,
            _ => Self::Generic,
        }
    }

    /// Classify a free-form error message.
    ///
    /// Only for adapters that never see a status code.
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("invalid credentials")
        {
            Self::AuthFailure
        } else if lower.contains("429") || lower.contains("rate limit") {
            Self::RateLimit
        } else {
            Self::Generic
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthFailure => write!(f, "auth_failure"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Errors a backend adapter can report.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("authentication rejected ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

impl BackendError {
    /// Build the error matching an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match FailureKind::from_status(status) {
            FailureKind::AuthFailure => Self::Auth { status, message },
            FailureKind::RateLimit => Self::RateLimited { message },
            FailureKind::Generic => Self::Http { status, message },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Auth { .. } | Self::NotConfigured(_) => FailureKind::AuthFailure,
            Self::RateLimited { .. } => FailureKind::RateLimit,
            Self::Timeout(_)
            | Self::Http { .. }
            | Self::Transport(_)
            | Self::InvalidResponse(_) => FailureKind::Generic,
        }
    }
}

/// A text-generation endpoint.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable name used in logs and status reports.
    fn name(&self) -> &str;

    /// Model identifier, informational only.
    fn model(&self) -> &str {
        ""
    }

    /// Generate a completion for `prompt`, optionally steered by `system_prompt`.
    async fn call(&self, prompt: &str, system_prompt: Option<&str>)
        -> Result<String, BackendError>;
}
