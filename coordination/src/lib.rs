//! Coordination core for the agent relay.
//!
//! This library provides:
//! - Per-backend health tracking with cooldown and rate-limit windows
//! - A generation router that falls back across backends and finally to a
//!   deterministic offline responder
//! - A named task handler registry
//! - A priority-grouped concurrent scheduler
//! - The request orchestrator tying planning, scheduling and consolidation
//!   together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coordination::{
//!     GenerationRouter, HandlerRegistry, Orchestrator, OrchestratorConfig, RouterConfig,
//! };
//!
//! # async fn run() -> Result<(), coordination::OrchestratorError> {
//! let router = Arc::new(GenerationRouter::new(Vec::new(), RouterConfig::default()));
//! let registry = Arc::new(HandlerRegistry::new());
//! let orchestrator = Orchestrator::new(router, registry, OrchestratorConfig::default())?;
//! let response = orchestrator.process("hello").await?;
//! println!("{}", response.response_text);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod backend;
pub mod handler;
pub mod orchestrator;
pub mod plan;
pub mod router;
pub mod scheduler;
pub mod store;

pub use backend::{
    Backend, BackendError, BackendHealth, FailureKind, HealthPolicy, HealthSnapshot,
};
pub use handler::{
    FailureReason, HandlerContext, HandlerRegistry, TaskFailure, TaskHandler, TaskResult,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, ProcessResponse};
pub use plan::{
    parse_plan_text, DependencyIssue, DependencyWarning, Plan, PlanBuildOptions, PlanError,
    PlanRepair, Task, TaskSpec, ValidationMode,
};
pub use router::{
    BackendStatus, Generation, GenerationRouter, GenerationSource, OfflineResponder,
    RouterConfig, RouterStatus, SharedRouter,
};
pub use scheduler::{
    PlanOutcome, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerPhase, TaskOutcome,
};
pub use store::{Exchange, ExchangeStore, MemoryExchangeStore, StoreError};
