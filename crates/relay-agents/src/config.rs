//! Relay configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (applied by the binary)
//! 2. Environment variables
//! 3. TOML file passed with `--config`
//! 4. Built-in defaults
//!
//! ## Built-in backends
//!
//! | Name            | Key variable             | Endpoint                               |
//! |-----------------|--------------------------|----------------------------------------|
//! | `mistral`       | `MISTRAL_API_KEY`        | `api.mistral.ai/v1`                    |
//! | `binarybrained` | `BINARYBRAINED_API_KEY`  | `api.groq.com/openai/v1`               |
//! | `openai`        | `OPENAI_API_KEY`         | `api.openai.com/v1`                    |
//! | `huggingface`   | `HUGGINGFACE_API_TOKEN`  | `api-inference.huggingface.co/models`  |
//!
//! Backends are tried in this order. A backend without a key is skipped.
//! `[[backends]]` entries in the TOML file replace a built-in of the same
//! name or are appended after the built-ins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use coordination::{HealthPolicy, RouterConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_TOKENS: u32 = 1_000;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_HISTORY: usize = 10;

const ENV_MAX_CONCURRENCY: &[&str] = &["RELAY_MAX_CONCURRENCY", "MAX_CONCURRENT_AGENTS"];
const ENV_TASK_TIMEOUT: &[&str] = &["RELAY_TASK_TIMEOUT_SECS", "AGENT_TIMEOUT"];
const ENV_CALL_TIMEOUT: &[&str] = &["RELAY_CALL_TIMEOUT_SECS"];
const ENV_PROJECT_ROOT: &[&str] = &["RELAY_PROJECT_ROOT"];
const ENV_HISTORY_PATH: &[&str] = &["RELAY_HISTORY_PATH"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Wire protocol of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `POST {base_url}/chat/completions` (Mistral, Groq, OpenAI, vLLM, ...)
    #[serde(alias = "openai_compatible")]
    OpenAi,
    /// `POST {base_url}/models/{model}`
    HuggingFace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    pub base_url: String,
    pub model: String,
    /// Literal key. Takes precedence over `api_key_env`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl BackendConfig {
    fn builtin(name: &str, kind: BackendKind, base_url: &str, model: &str, env: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key: None,
            api_key_env: Some(env.to_string()),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn has_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Key with everything but the first four characters hidden.
    pub fn masked_key(&self) -> String {
        match self.api_key.as_deref() {
            Some(k) if !k.is_empty() => {
                let head: String = k.chars().take(4).collect();
                format!("{head}…")
            }
            _ => "<unset>".to_string(),
        }
    }
}

/// Built-in backends in fallback order.
pub fn builtin_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::builtin(
            "mistral",
            BackendKind::OpenAi,
            "https://api.mistral.ai/v1",
            "mistral-small-latest",
            "MISTRAL_API_KEY",
        ),
        BackendConfig::builtin(
            "binarybrained",
            BackendKind::OpenAi,
            "https://api.groq.com/openai/v1",
            "llama-3.3-70b-versatile",
            "BINARYBRAINED_API_KEY",
        ),
        BackendConfig::builtin(
            "openai",
            BackendKind::OpenAi,
            "https://api.openai.com/v1",
            "gpt-3.5-turbo",
            "OPENAI_API_KEY",
        ),
        BackendConfig::builtin(
            "huggingface",
            BackendKind::HuggingFace,
            "https://api-inference.huggingface.co",
            "mistralai/Mistral-7B-Instruct-v0.2",
            "HUGGINGFACE_API_TOKEN",
        ),
    ]
}

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub backends: Vec<BackendConfig>,
    pub call_timeout: Duration,
    pub health: HealthPolicy,
    pub scheduler: SchedulerConfig,
    /// Root searched by the file picker.
    pub project_root: PathBuf,
    /// JSONL file receiving saved exchanges. `None` disables persistence.
    pub history_path: Option<PathBuf>,
    /// Interactions kept per handler history.
    pub max_history: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backends: builtin_backends(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            health: HealthPolicy::default(),
            scheduler: SchedulerConfig::default(),
            project_root: PathBuf::from("."),
            history_path: None,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

/// TOML file layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    call_timeout_secs: Option<u64>,
    project_root: Option<PathBuf>,
    history_path: Option<PathBuf>,
    max_history: Option<usize>,
    scheduler: SchedulerSection,
    health: HealthSection,
    backends: Vec<BackendConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SchedulerSection {
    max_concurrency: Option<usize>,
    task_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct HealthSection {
    max_errors: Option<u32>,
    cooldown_secs: Option<u64>,
    rate_limit_window_secs: Option<u64>,
}

impl RelayConfig {
    /// Defaults, then `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load) with an explicit environment lookup.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = path {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            config.apply_toml(&content)?;
            debug!(path = %path.display(), "loaded config file");
        }
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a TOML document.
    pub fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(content)?;

        if let Some(secs) = file.call_timeout_secs {
            self.call_timeout = Duration::from_secs(secs);
        }
        if let Some(root) = file.project_root {
            self.project_root = root;
        }
        if file.history_path.is_some() {
            self.history_path = file.history_path;
        }
        if let Some(n) = file.max_history {
            self.max_history = n;
        }
        if let Some(n) = file.scheduler.max_concurrency {
            self.scheduler.max_concurrency = n;
        }
        if let Some(secs) = file.scheduler.task_timeout_secs {
            self.scheduler.task_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = file.health.max_errors {
            self.health.max_errors = n;
        }
        if let Some(secs) = file.health.cooldown_secs {
            self.health.cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = file.health.rate_limit_window_secs {
            self.health.rate_limit_window = Duration::from_secs(secs);
        }

        for backend in file.backends {
            match self.backends.iter_mut().find(|b| b.name == backend.name) {
                Some(existing) => *existing = backend,
                None => self.backends.push(backend),
            }
        }
        Ok(())
    }

    /// Overlay values from the environment and resolve backend keys.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| -> Option<(String, String)> {
            keys.iter()
                .find_map(|k| lookup(k).map(|v| (k.to_string(), v)))
        };

        if let Some((key, value)) = first(ENV_MAX_CONCURRENCY) {
            self.scheduler.max_concurrency = parse_value(&key, &value)?;
        }
        if let Some((key, value)) = first(ENV_TASK_TIMEOUT) {
            self.scheduler.task_timeout = Duration::from_secs(parse_value(&key, &value)?);
        }
        if let Some((key, value)) = first(ENV_CALL_TIMEOUT) {
            self.call_timeout = Duration::from_secs(parse_value(&key, &value)?);
        }
        if let Some((_, value)) = first(ENV_PROJECT_ROOT) {
            self.project_root = PathBuf::from(value);
        }
        if let Some((_, value)) = first(ENV_HISTORY_PATH) {
            self.history_path = Some(PathBuf::from(value));
        }

        for backend in &mut self.backends {
            if backend.has_key() {
                continue;
            }
            if let Some(env) = &backend.api_key_env {
                backend.api_key = lookup(env).filter(|k| !k.trim().is_empty());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate().map_err(ConfigError::Invalid)?;
        self.health.validate().map_err(ConfigError::Invalid)?;
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("call timeout must be non-zero".into()));
        }
        let mut names = std::collections::HashSet::new();
        for b in &self.backends {
            if !names.insert(b.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate backend name '{}'", b.name)));
            }
            if b.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("backend '{}' has no base_url", b.name)));
            }
        }
        Ok(())
    }

    /// Backends that have a key, in fallback order.
    pub fn enabled_backends(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.has_key()).collect()
    }

    /// Backends left out for lack of a key.
    pub fn skipped_backends(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| !b.has_key()).collect()
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            call_timeout: self.call_timeout,
            health: self.health,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::load_with(None, env(&[])).unwrap();
        assert_eq!(config.scheduler.max_concurrency, 3);
        assert_eq!(config.scheduler.task_timeout, Duration::from_secs(300));
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.health.max_errors, 2);
        assert!(config.enabled_backends().is_empty());
        let names: Vec<&str> = config.backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["mistral", "binarybrained", "openai", "huggingface"]);
    }

    #[test]
    fn test_keys_enable_backends_in_order() {
        let config = RelayConfig::load_with(
            None,
            env(&[("OPENAI_API_KEY", "sk-test"), ("MISTRAL_API_KEY", "m-key")]),
        )
        .unwrap();
        let enabled: Vec<&str> = config
            .enabled_backends()
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(enabled, vec!["mistral", "openai"]);

        let skipped: Vec<&str> = config
            .skipped_backends()
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(skipped, vec!["binarybrained", "huggingface"]);
    }

    #[test]
    fn test_env_aliases_and_primary_precedence() {
        let config = RelayConfig::load_with(
            None,
            env(&[
                ("MAX_CONCURRENT_AGENTS", "5"),
                ("AGENT_TIMEOUT", "120"),
                ("RELAY_TASK_TIMEOUT_SECS", "60"),
            ]),
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrency, 5);
        assert_eq!(config.scheduler.task_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_env_value() {
        let err = RelayConfig::load_with(None, env(&[("RELAY_MAX_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_toml_overlay_then_env() {
        let mut config = RelayConfig::default();
        config
            .apply_toml(
                r#"
call_timeout_secs = 10
max_history = 4

[scheduler]
max_concurrency = 8

[health]
cooldown_secs = 120

[[backends]]
name = "openai"
kind = "openai"
base_url = "http://localhost:9999/v1"
model = "local-model"
api_key = "inline"

[[backends]]
name = "vllm"
kind = "openai"
base_url = "http://gpu-box:8000/v1"
model = "qwen"
api_key_env = "VLLM_KEY"
"#,
            )
            .unwrap();
        config
            .apply_env(env(&[("VLLM_KEY", "v"), ("RELAY_MAX_CONCURRENCY", "2")]))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.max_history, 4);
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.health.cooldown, Duration::from_secs(120));
        let enabled: Vec<&str> = config
            .enabled_backends()
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(enabled, vec!["openai", "vllm"]);
        assert_eq!(config.backends[2].base_url, "http://localhost:9999/v1");
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        let mut config = RelayConfig::default();
        assert!(matches!(
            config.apply_toml("max_conccurency = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rate_window_must_be_shorter_than_cooldown() {
        let mut config = RelayConfig::default();
        config
            .apply_toml("[health]\ncooldown_secs = 30\nrate_limit_window_secs = 60\n")
            .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_masked_key() {
        let mut b = builtin_backends().remove(0);
        assert_eq!(b.masked_key(), "<unset>");
        b.api_key = Some("sk-abcdef".into());
        assert_eq!(b.masked_key(), "sk-a…");
    }
}
