//! Generation Router
//!
//! Routes every generation call across an ordered list of backends:
//!
//! ```text
//! snapshot usable backends ──► round-robin attempts ──► first success
//!          │ (none)                    │ (all failed)
//!          └──────────────►  offline responder  ◄──┘
//! ```
//!
//! The router owns each backend's [`BackendHealth`] behind its own lock.
//! Locks are held only for synchronous state updates, never across a
//! backend call. `generate` never returns an error: callers always get
//! text, possibly from the [`OfflineResponder`].

pub mod offline;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, BackendHealth, FailureKind, HealthPolicy, HealthSnapshot,
};

pub use offline::{OfflineIntent, OfflineResponder};

/// Default upper bound on a single backend call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Timeout applied to each individual backend call.
    pub call_timeout: Duration,
    /// Health thresholds applied to every backend.
    pub health: HealthPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            health: HealthPolicy::default(),
        }
    }
}

/// Where a generation's text came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationSource {
    Backend { name: String },
    Offline,
}

/// A failed attempt recorded during one `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptError {
    pub backend: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Result of one routed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub source: GenerationSource,
    /// Backend calls made (0 when no backend was usable).
    pub attempts: usize,
    pub errors: Vec<AttemptError>,
}

impl Generation {
    pub fn is_offline(&self) -> bool {
        self.source == GenerationSource::Offline
    }

    pub fn backend_name(&self) -> Option<&str> {
        match &self.source {
            GenerationSource::Backend { name } => Some(name),
            GenerationSource::Offline => None,
        }
    }
}

struct ManagedBackend {
    backend: Arc<dyn Backend>,
    health: Mutex<BackendHealth>,
}

impl ManagedBackend {
    fn health(&self) -> MutexGuard<'_, BackendHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-backend entry of a [`RouterStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub model: String,
    pub usable: bool,
    pub health: HealthSnapshot,
}

/// Aggregate router statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatus {
    pub backends: Vec<BackendStatus>,
    pub total_backends: usize,
    pub usable_backends: usize,
    pub request_count: u64,
    pub success_count: u64,
    pub offline_count: u64,
    /// Fraction of requests answered by a real backend.
    pub success_rate: f64,
}

pub struct GenerationRouter {
    backends: Vec<ManagedBackend>,
    config: RouterConfig,
    offline: OfflineResponder,
    request_count: AtomicU64,
    success_count: AtomicU64,
    offline_count: AtomicU64,
}

/// Shared router handle.
pub type SharedRouter = Arc<GenerationRouter>;

impl GenerationRouter {
    /// Build a router over `backends`, tried in the given order.
    pub fn new(backends: Vec<Arc<dyn Backend>>, config: RouterConfig) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| ManagedBackend {
                backend,
                health: Mutex::new(BackendHealth::new(config.health)),
            })
            .collect::<Vec<_>>();
        info!(count = backends.len(), "generation router initialised");
        Self {
            backends,
            config,
            offline: OfflineResponder,
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            offline_count: AtomicU64::new(0),
        }
    }

    /// Router with no backends; every call is answered offline.
    pub fn offline_only() -> Self {
        Self::new(Vec::new(), RouterConfig::default())
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|m| m.backend.name().to_string())
            .collect()
    }

    /// Produce text for `prompt`. Never fails.
    ///
    /// `max_attempts` defaults to the number of usable backends.
    pub async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        max_attempts: Option<usize>,
    ) -> Generation {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let candidates = self.usable_indices();
        if candidates.is_empty() {
            warn!(
                total = self.backends.len(),
                "no usable backends, answering offline"
            );
            return self.answer_offline(prompt, 0, Vec::new());
        }

        let attempts = match max_attempts {
            Some(n) if n > 0 => n,
            _ => candidates.len(),
        };
        let mut errors = Vec::new();

        for attempt in 0..attempts {
            let managed = &self.backends[candidates[attempt % candidates.len()]];
            let name = managed.backend.name();
            debug!(backend = %name, attempt = attempt + 1, of = attempts, "calling backend");

            let result = match tokio::time::timeout(
                self.config.call_timeout,
                managed.backend.call(prompt, system_prompt),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.config.call_timeout)),
            };

            match result {
                Ok(text) => {
                    managed.health().record_success();
                    self.success_count.fetch_add(1, Ordering::Relaxed);
                    info!(backend = %name, attempts = attempt + 1, "generation succeeded");
                    return Generation {
                        text,
                        source: GenerationSource::Backend {
                            name: name.to_string(),
                        },
                        attempts: attempt + 1,
                        errors,
                    };
                }
                Err(err) => {
                    let kind = err.kind();
                    managed.health().record_failure(kind);
                    warn!(
                        backend = %name,
                        attempt = attempt + 1,
                        %kind,
                        error = %err,
                        "backend call failed"
                    );
                    errors.push(AttemptError {
                        backend: name.to_string(),
                        kind,
                        message: err.to_string(),
                    });
                }
            }
        }

        warn!(attempts, "all backend attempts failed, answering offline");
        self.answer_offline(prompt, attempts, errors)
    }

    fn answer_offline(
        &self,
        prompt: &str,
        attempts: usize,
        errors: Vec<AttemptError>,
    ) -> Generation {
        self.offline_count.fetch_add(1, Ordering::Relaxed);
        Generation {
            text: self.offline.respond(prompt),
            source: GenerationSource::Offline,
            attempts,
            errors,
        }
    }

    fn usable_indices(&self) -> Vec<usize> {
        self.backends
            .iter()
            .enumerate()
            .filter(|(_, m)| m.health().can_use())
            .map(|(i, _)| i)
            .collect()
    }

    fn find(&self, name: &str) -> Option<&ManagedBackend> {
        self.backends.iter().find(|m| m.backend.name() == name)
    }

    /// Health snapshot of a backend by name.
    pub fn health_of(&self, name: &str) -> Option<HealthSnapshot> {
        self.find(name).map(|m| m.health().snapshot())
    }

    /// Whether a backend would be tried by the next call.
    pub fn is_usable(&self, name: &str) -> bool {
        self.find(name).map(|m| m.health().can_use()).unwrap_or(false)
    }

    /// Clear a backend's failure state after its credentials were changed.
    pub fn reset_backend(&self, name: &str) -> bool {
        match self.find(name) {
            Some(m) => {
                m.health().reset();
                info!(backend = %name, "backend health reset");
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> RouterStatus {
        let backends: Vec<BackendStatus> = self
            .backends
            .iter()
            .map(|m| {
                let mut health = m.health();
                BackendStatus {
                    name: m.backend.name().to_string(),
                    model: m.backend.model().to_string(),
                    usable: health.can_use(),
                    health: health.snapshot(),
                }
            })
            .collect();
        let request_count = self.request_count.load(Ordering::Relaxed);
        let success_count = self.success_count.load(Ordering::Relaxed);
        let success_rate = if request_count == 0 {
            0.0
        } else {
            success_count as f64 / request_count as f64
        };

        RouterStatus {
            total_backends: backends.len(),
            usable_backends: backends.iter().filter(|b| b.usable).count(),
            backends,
            request_count,
            success_count,
            offline_count: self.offline_count.load(Ordering::Relaxed),
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Flaky {
        name: String,
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for Flaky {
        fn name(&self) -> &str {
            &self.name
        }

        async fn call(&self, _prompt: &str, _system: Option<&str>) -> Result<String, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(BackendError::Transport("connection reset".into()))
            } else {
                Ok(format!("{} ok", self.name))
            }
        }
    }

    fn flaky(name: &str, fail_first: usize) -> Arc<Flaky> {
        Arc::new(Flaky {
            name: name.into(),
            fail_first,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_round_robin_wraps_within_snapshot() {
        let only = flaky("solo", 1);
        let backends: Vec<Arc<dyn Backend>> = vec![only.clone()];
        let router = GenerationRouter::new(backends, RouterConfig::default());
        let gen = router.generate("hello", None, Some(2)).await;
        assert_eq!(gen.backend_name(), Some("solo"));
        assert_eq!(gen.attempts, 2);
        assert_eq!(gen.errors.len(), 1);
        assert_eq!(only.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_means_all_candidates() {
        let a = flaky("a", usize::MAX);
        let b = flaky("b", 0);
        let backends: Vec<Arc<dyn Backend>> = vec![a, b];
        let router = GenerationRouter::new(backends, RouterConfig::default());
        let gen = router.generate("x", None, Some(0)).await;
        assert_eq!(gen.backend_name(), Some("b"));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let backends: Vec<Arc<dyn Backend>> = vec![flaky("a", 0)];
        let router = GenerationRouter::new(backends, RouterConfig::default());
        router.generate("one", None, None).await;
        router.generate("two", None, None).await;
        let status = router.status();
        assert_eq!(status.request_count, 2);
        assert_eq!(status.success_count, 2);
        assert_eq!(status.offline_count, 0);
        assert!((status.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(status.usable_backends, 1);
    }

    #[tokio::test]
    async fn test_reset_backend_unknown_name() {
        let router = GenerationRouter::offline_only();
        assert!(!router.reset_backend("missing"));
        assert!(router.health_of("missing").is_none());
    }
}
