//! Task handler capability and registry.
//!
//! A [`TaskHandler`] turns one [`Task`] into a JSON payload. Handlers are
//! looked up by name in a [`HandlerRegistry`]; an unknown name yields a
//! [`FailureReason::HandlerNotFound`] failure instead of an error.
//!
//! Handlers receive a [`HandlerContext`] giving them the generation router
//! and the registry itself, so a handler may call other handlers directly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::plan::Task;
use crate::router::{Generation, GenerationRouter};

/// Nesting limit for handler-to-handler calls.
pub const MAX_CALL_DEPTH: usize = 8;

/// Why a task did not produce a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No handler registered under the task's handler name.
    HandlerNotFound,
    /// The handler exceeded the per-task timeout.
    Timeout,
    /// The handler returned an error.
    HandlerFailed,
    /// The task (or nested call) was malformed.
    InvalidInput,
    /// The handler panicked.
    Panicked,
    /// The task never reported a result.
    Aborted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerNotFound => write!(f, "handler_not_found"),
            Self::Timeout => write!(f, "timeout"),
            Self::HandlerFailed => write!(f, "handler_failed"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::Panicked => write!(f, "panicked"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Structured task failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: FailureReason,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureReason, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn handler_not_found(name: &str) -> Self {
        Self::new(
            FailureReason::HandlerNotFound,
            format!("no handler registered as '{name}'"),
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(FailureReason::HandlerFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureReason::InvalidInput, message)
    }
}

/// Payload or failure of a single task.
pub type TaskResult = Result<serde_json::Value, TaskFailure>;

/// A named unit of work logic.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    /// One-line description shown in planner prompts.
    fn description(&self) -> &str {
        ""
    }

    async fn handle(&self, task: &Task, ctx: &HandlerContext) -> TaskResult;
}

/// Name → handler map.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its own name, replacing any previous entry.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(handler = %name, "replacing previously registered handler");
        }
        self
    }

    pub fn with(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .handlers
            .iter()
            .map(|(k, h)| (k.clone(), h.description().to_string()))
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run `task` on the handler it names.
    pub async fn dispatch(&self, task: &Task, ctx: &HandlerContext) -> TaskResult {
        match self.get(&task.handler) {
            Some(handler) => {
                debug!(
                    task = %task.id,
                    handler = %task.handler,
                    depth = ctx.depth,
                    "dispatching task"
                );
                handler.handle(task, ctx).await
            }
            None => Err(TaskFailure::handler_not_found(&task.handler)),
        }
    }
}

/// Shared state handed to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    pub router: Arc<GenerationRouter>,
    pub registry: Arc<HandlerRegistry>,
    /// The user request the plan was built from.
    pub request: Arc<str>,
    pub request_id: Arc<str>,
    /// 0 for tasks run by the scheduler, +1 per nested handler call.
    pub depth: usize,
    /// Backend attempts per generation; `None` tries every usable backend.
    pub max_attempts: Option<usize>,
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("request_id", &self.request_id)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl HandlerContext {
    pub fn new(
        router: Arc<GenerationRouter>,
        registry: Arc<HandlerRegistry>,
        request: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            router,
            registry,
            request: request.into(),
            request_id: uuid::Uuid::new_v4().to_string().into(),
            depth: 0,
            max_attempts: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<Arc<str>>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Route a generation call. Never fails.
    pub async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Generation {
        self.router
            .generate(prompt, system_prompt, self.max_attempts)
            .await
    }

    /// Call another handler synchronously from inside a handler.
    pub async fn call_handler(&self, name: &str, task: &Task) -> TaskResult {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(TaskFailure::invalid_input(format!(
                "handler call depth {} exceeds limit {MAX_CALL_DEPTH}",
                self.depth + 1
            )));
        }
        let child = Self {
            depth: self.depth + 1,
            ..self.clone()
        };
        let mut task = task.clone();
        task.handler = name.to_string();
        self.registry.dispatch(&task, &child).await
    }
}
