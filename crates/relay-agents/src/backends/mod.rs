//! HTTP backend adapters and router construction.

pub mod huggingface;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use coordination::{Backend, BackendError, GenerationRouter};
use tracing::{info, warn};

use crate::config::{BackendConfig, BackendKind, RelayConfig};

pub use huggingface::HuggingFaceBackend;
pub use openai::OpenAiCompatibleBackend;

/// Longest error body kept in a [`BackendError`] message.
const MAX_ERROR_BODY: usize = 500;

/// The HTTP client gives up slightly before the router's own call timeout.
const CLIENT_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

pub(crate) fn error_body(body: &str) -> String {
    let trimmed = body.trim();
    let mut out: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
    if trimmed.chars().count() > MAX_ERROR_BODY {
        out.push_str("...");
    }
    out
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(timeout)
    } else {
        BackendError::Transport(e.to_string())
    }
}

/// Build one adapter from its configuration.
pub fn build_backend(
    config: &BackendConfig,
    timeout: Duration,
) -> Result<Arc<dyn Backend>, BackendError> {
    Ok(match config.kind {
        BackendKind::OpenAi => Arc::new(OpenAiCompatibleBackend::new(config, timeout)?),
        BackendKind::HuggingFace => Arc::new(HuggingFaceBackend::new(config, timeout)?),
    })
}

/// Adapters for every backend that has a key, in fallback order.
pub fn build_backends(config: &RelayConfig) -> Vec<Arc<dyn Backend>> {
    let timeout = config
        .call_timeout
        .checked_sub(CLIENT_TIMEOUT_MARGIN)
        .filter(|t| !t.is_zero())
        .unwrap_or(config.call_timeout);

    for b in config.skipped_backends() {
        info!(backend = %b.name, "no API key configured, backend skipped");
    }

    config
        .enabled_backends()
        .into_iter()
        .filter_map(|b| match build_backend(b, timeout) {
            Ok(backend) => {
                info!(
                    backend = %b.name,
                    model = %b.model,
                    key = %b.masked_key(),
                    "backend enabled"
                );
                Some(backend)
            }
            Err(e) => {
                warn!(backend = %b.name, error = %e, "failed to build backend");
                None
            }
        })
        .collect()
}

pub fn build_router(config: &RelayConfig) -> GenerationRouter {
    GenerationRouter::new(build_backends(config), config.router_config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_truncates() {
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        let out = error_body(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), MAX_ERROR_BODY + 3);
        assert_eq!(error_body("  short \n"), "short");
    }

    #[test]
    fn test_missing_key_is_not_configured() {
        let config = crate::config::builtin_backends().remove(0);
        let err = build_backend(&config, Duration::from_secs(5)).err().unwrap();
        assert!(matches!(err, BackendError::NotConfigured(_)));
    }
}
