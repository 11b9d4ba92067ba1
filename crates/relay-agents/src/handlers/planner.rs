//! Planner: decomposes a request into a prioritized task list.

use async_trait::async_trait;
use coordination::{
    parse_plan_text, HandlerContext, Plan, Task, TaskHandler, TaskResult, TaskSpec,
};
use serde_json::json;
use tracing::{debug, warn};

use super::source_json;

const SYSTEM_PROMPT: &str = "You are a planning agent. You split a user request into a small \
number of concrete steps, each handled by one specialist agent. You answer with JSON only.";

pub struct PlannerHandler {
    /// Handler given the whole request when no plan can be parsed.
    fallback_handler: String,
}

impl Default for PlannerHandler {
    fn default() -> Self {
        Self::new("coder")
    }
}

impl PlannerHandler {
    pub fn new(fallback_handler: impl Into<String>) -> Self {
        Self {
            fallback_handler: fallback_handler.into(),
        }
    }

    fn prompt(&self, request: &str, ctx: &HandlerContext) -> String {
        let agents = ctx
            .registry
            .descriptions()
            .into_iter()
            .filter(|(name, _)| name != self.name())
            .map(|(name, desc)| format!("- {name}: {desc}"))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Available agents:\n{agents}\n\n\
             Request:\n{request}\n\n\
             Respond with a JSON array. Each element has the fields:\n\
             - \"id\": short unique step id\n\
             - \"agent\": one of the agent names above\n\
             - \"task\": what the agent must do\n\
             - \"priority\": integer >= 1; steps with the same priority run in parallel, \
               lower numbers run first\n\
             - \"dependencies\": ids of steps whose output this step needs\n\
             - \"inputs\" / \"outputs\": short names of the data consumed and produced\n\
             Use as few steps as the request needs."
        )
    }

    fn fallback_spec(&self, request: &str) -> TaskSpec {
        let plan = Plan::fallback(self.fallback_handler.clone(), request);
        TaskSpec::from(&plan.tasks()[0])
    }
}

#[async_trait]
impl TaskHandler for PlannerHandler {
    fn name(&self) -> &str {
        "planner"
    }

    fn description(&self) -> &str {
        "Breaks a request into prioritized steps for the other agents"
    }

    async fn handle(&self, task: &Task, ctx: &HandlerContext) -> TaskResult {
        let prompt = self.prompt(&task.instruction, ctx);
        let generation = ctx.generate(&prompt, Some(SYSTEM_PROMPT)).await;

        if generation.is_offline() {
            debug!("planner answered offline, using single-step plan");
            return Ok(json!({
                "plan": [self.fallback_spec(&task.instruction)],
                "source": "offline",
            }));
        }

        match parse_plan_text(&generation.text) {
            Ok(specs) => {
                debug!(steps = specs.len(), "planner produced plan");
                Ok(json!({ "plan": specs, "source": source_json(&generation) }))
            }
            Err(e) => {
                warn!(error = %e, "planner output is not a plan, using single-step plan");
                Ok(json!({
                    "plan": [self.fallback_spec(&task.instruction)],
                    "source": source_json(&generation),
                    "parse_error": e.to_string(),
                }))
            }
        }
    }
}
