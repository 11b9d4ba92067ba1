//! Request orchestrator: plan → schedule → consolidate.
//!
//! [`Orchestrator::process`] is the single entry point for a user request.
//! It asks the planner handler (when registered) for a multi-task plan,
//! falls back to a one-task plan otherwise, runs it through the
//! [`Scheduler`], and folds the task results into one response text.
//!
//! Only a request that cannot become a plan at all (empty input) is an
//! error. Backend failures, task failures and persistence failures all end
//! up inside a normal [`ProcessResponse`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::handler::{HandlerContext, HandlerRegistry};
use crate::plan::{Plan, PlanBuildOptions, Task, TaskSpec, ValidationMode};
use crate::router::GenerationRouter;
use crate::scheduler::{PlanOutcome, Scheduler, SchedulerConfig, TaskOutcome};
use crate::store::{Exchange, ExchangeStore};

/// Characters of each task result included in the consolidation prompt.
pub const RESULT_DIGEST_CHARS: usize = 500;

const CONSOLIDATION_SYSTEM_PROMPT: &str = "You combine the results of several specialist \
agents into one clear, complete answer for the user. Keep code blocks intact, drop \
duplicated content, and mention briefly any part of the request that could not be completed.";

/// Payload keys searched, in order, for a task's human-readable text.
const TEXT_FIELDS: &[&str] = &["response", "code", "summary", "analysis", "review", "content"];

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("request is empty")]
    EmptyRequest,

    #[error("invalid orchestrator configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Handler asked to decompose the request. Skipped when unregistered.
    pub planner_handler: String,
    /// Handler for the fallback plan and for repaired entries.
    pub default_handler: String,
    pub scheduler: SchedulerConfig,
    pub validation: ValidationMode,
    /// Ask a backend to merge task results; otherwise concatenate them.
    pub consolidate: bool,
    /// Backend attempts per generation call; `None` tries every usable backend.
    pub max_attempts: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            planner_handler: "planner".to_string(),
            default_handler: "coder".to_string(),
            scheduler: SchedulerConfig::default(),
            validation: ValidationMode::Repair,
            consolidate: true,
            max_attempts: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.default_handler.trim().is_empty() {
            return Err("default_handler must not be empty".into());
        }
        self.scheduler.validate()
    }
}

/// Response returned for every processed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    /// At least one task produced a result.
    pub success: bool,
    pub response_text: String,
    /// Distinct handlers of the executed plan, in execution order.
    pub used_handlers: Vec<String>,
    pub request_id: String,
    pub task_count: usize,
    pub failed_tasks: Vec<String>,
    /// Corrections applied to the planner's output.
    pub plan_repairs: usize,
    /// `None` when no store is attached or no user was given.
    pub history_saved: Option<bool>,
    pub outcomes: Vec<TaskOutcome>,
}

pub struct Orchestrator {
    router: Arc<GenerationRouter>,
    registry: Arc<HandlerRegistry>,
    config: OrchestratorConfig,
    store: Option<Arc<dyn ExchangeStore>>,
}

impl Orchestrator {
    pub fn new(
        router: Arc<GenerationRouter>,
        registry: Arc<HandlerRegistry>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate().map_err(OrchestratorError::InvalidConfig)?;
        if !registry.contains(&config.default_handler) {
            warn!(
                handler = %config.default_handler,
                "default handler is not registered; fallback plans will fail"
            );
        }
        Ok(Self {
            router,
            registry,
            config,
            store: None,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ExchangeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn router(&self) -> &Arc<GenerationRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn context(&self, request: &str) -> HandlerContext {
        HandlerContext::new(self.router.clone(), self.registry.clone(), request)
            .with_max_attempts(self.config.max_attempts)
    }

    /// Process a request without persisting it.
    pub async fn process(&self, request: &str) -> Result<ProcessResponse, OrchestratorError> {
        let request = request.trim();
        if request.is_empty() {
            return Err(OrchestratorError::EmptyRequest);
        }
        let ctx = self.context(request);
        info!(request_id = %ctx.request_id, "processing request");

        let plan = self.create_plan(request, &ctx).await;
        Ok(self.run(plan, request, &ctx).await)
    }

    /// Process a request and hand the exchange to the attached store.
    ///
    /// A failing store is logged and reported through `history_saved`.
    pub async fn process_for_user(
        &self,
        user_id: &str,
        request: &str,
    ) -> Result<ProcessResponse, OrchestratorError> {
        let mut response = self.process(request).await?;
        if let Some(store) = &self.store {
            let exchange = Exchange {
                user_id: user_id.to_string(),
                request_id: response.request_id.clone(),
                request: request.trim().to_string(),
                response: response.response_text.clone(),
                success: response.success,
                used_handlers: response.used_handlers.clone(),
                timestamp: Utc::now(),
            };
            let saved = match store.save_exchange(&exchange).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        user = %user_id,
                        request_id = %response.request_id,
                        error = %e,
                        "failed to save exchange"
                    );
                    false
                }
            };
            response.history_saved = Some(saved);
        }
        Ok(response)
    }

    /// Run an already-built plan for `request`.
    pub async fn execute_plan(&self, plan: Plan, request: &str) -> ProcessResponse {
        let ctx = self.context(request);
        self.run(plan, request, &ctx).await
    }

    async fn run(&self, plan: Plan, request: &str, ctx: &HandlerContext) -> ProcessResponse {
        for (task_id, handler) in plan.unresolved_handlers(&self.registry) {
            warn!(task = %task_id, handler = %handler, "plan names an unregistered handler");
        }

        let scheduler = Scheduler::new(self.config.scheduler);
        let outcome = scheduler.execute(&plan, ctx).await;
        let response_text = self.consolidate(request, &outcome).await;

        let outcomes: Vec<TaskOutcome> = outcome.ordered().into_iter().cloned().collect();
        let failed_tasks: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.task_id.clone())
            .collect();

        info!(
            request_id = %ctx.request_id,
            tasks = plan.len(),
            failed = failed_tasks.len(),
            "request processed"
        );

        ProcessResponse {
            success: outcome.succeeded() > 0,
            response_text,
            used_handlers: plan.handler_names(),
            request_id: ctx.request_id.to_string(),
            task_count: plan.len(),
            failed_tasks,
            plan_repairs: plan.repairs().len(),
            history_saved: None,
            outcomes,
        }
    }

    /// Ask the planner for a plan; fall back to a single task on any problem.
    pub async fn create_plan(&self, request: &str, ctx: &HandlerContext) -> Plan {
        let fallback = || Plan::fallback(self.config.default_handler.clone(), request);

        if !self.registry.contains(&self.config.planner_handler) {
            return fallback();
        }

        let planning_task = Task::new("plan", self.config.planner_handler.clone(), request);
        let payload = match self.registry.dispatch(&planning_task, ctx).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "planner failed, using fallback plan");
                return fallback();
            }
        };

        let specs: Vec<TaskSpec> = match payload
            .get("plan")
            .cloned()
            .map(serde_json::from_value::<Vec<TaskSpec>>)
        {
            Some(Ok(specs)) if !specs.is_empty() => specs,
            Some(Err(e)) => {
                warn!(error = %e, "planner payload is malformed, using fallback plan");
                return fallback();
            }
            _ => {
                warn!("planner returned no tasks, using fallback plan");
                return fallback();
            }
        };

        let known: HashSet<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|n| *n != self.config.planner_handler)
            .collect();
        let options = PlanBuildOptions {
            mode: self.config.validation,
            default_handler: self.config.default_handler.clone(),
            known_handlers: Some(known),
            request: Some(request.to_string()),
        };

        match Plan::from_specs(specs, &options) {
            Ok(plan) => {
                info!(tasks = plan.len(), repairs = plan.repairs().len(), "plan created");
                plan
            }
            Err(e) => {
                warn!(error = %e, "planner output rejected, using fallback plan");
                fallback()
            }
        }
    }

    async fn consolidate(&self, request: &str, outcome: &PlanOutcome) -> String {
        let ordered = outcome.ordered();
        let has_text = ordered
            .iter()
            .any(|o| o.result.as_ref().ok().and_then(payload_text).is_some());

        // Nothing to merge, or merging disabled.
        if !self.config.consolidate || !has_text || ordered.len() == 1 {
            return format_results(&ordered);
        }

        let prompt = consolidation_prompt(request, &ordered);
        let generation = self
            .router
            .generate(&prompt, Some(CONSOLIDATION_SYSTEM_PROMPT), self.config.max_attempts)
            .await;
        if generation.is_offline() {
            info!("consolidation answered offline, formatting task results directly");
            return format_results(&ordered);
        }
        generation.text
    }
}

/// Human-readable text of a task payload, if any.
pub fn payload_text(payload: &serde_json::Value) -> Option<String> {
    if let Some(s) = payload.as_str() {
        return (!s.trim().is_empty()).then(|| s.to_string());
    }
    TEXT_FIELDS.iter().find_map(|key| {
        payload
            .get(*key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    })
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn consolidation_prompt(request: &str, outcomes: &[&TaskOutcome]) -> String {
    let mut prompt = format!("User request:\n{request}\n\nAgent results:\n");
    for o in outcomes {
        match &o.result {
            Ok(payload) => {
                let text = payload_text(payload).unwrap_or_else(|| payload.to_string());
                prompt.push_str(&format!(
                    "\n[{} via {}] succeeded:\n{}\n",
                    o.task_id,
                    o.handler,
                    truncate_chars(&text, RESULT_DIGEST_CHARS)
                ));
            }
            Err(f) => {
                prompt.push_str(&format!(
                    "\n[{} via {}] failed ({}): {}\n",
                    o.task_id, o.handler, f.kind, f.message
                ));
            }
        }
    }
    prompt.push_str("\nWrite the final answer to the user's request.");
    prompt
}

/// Deterministic merge of task results.
pub fn format_results(outcomes: &[&TaskOutcome]) -> String {
    let texts: Vec<(&str, String)> = outcomes
        .iter()
        .filter_map(|o| {
            o.result
                .as_ref()
                .ok()
                .and_then(payload_text)
                .map(|t| (o.task_id.as_str(), t))
        })
        .collect();
    let failures: Vec<&TaskOutcome> = outcomes
        .iter()
        .copied()
        .filter(|o| !o.is_success())
        .collect();

    let mut out = match texts.as_slice() {
        [] => String::new(),
        [(_, only)] => only.clone(),
        many => many
            .iter()
            .map(|(id, text)| format!("## {id}\n\n{text}"))
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    if !failures.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("Completed with some errors:");
        for f in failures {
            if let Err(e) = &f.result {
                out.push_str(&format!("\n- {}: {}", f.task_id, e));
            }
        }
    } else if out.is_empty() {
        out.push_str("All tasks completed successfully.");
    }
    out
}
