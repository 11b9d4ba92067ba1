//! Concrete collaborators for the `coordination` crate.
//!
//! - [`backends`]: HTTP adapters for OpenAI-compatible and HuggingFace APIs
//! - [`handlers`]: the planner and the specialist task handlers
//! - [`config`]: layered configuration (defaults, TOML, environment)
//! - [`history`]: bounded per-handler interaction history
//! - [`store`]: JSONL exchange persistence

pub mod backends;
pub mod config;
pub mod handlers;
pub mod history;
pub mod store;

pub use config::{BackendConfig, BackendKind, ConfigError, RelayConfig};
pub use handlers::default_registry;
pub use store::JsonlExchangeStore;
