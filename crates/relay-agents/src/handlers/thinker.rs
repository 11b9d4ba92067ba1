use async_trait::async_trait;
use coordination::{HandlerContext, Task, TaskHandler, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::source_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    General,
    ProblemSolving,
    Design,
    Analytical,
}

impl ThinkingMode {
    /// Pick a mode from keywords in the instruction.
    pub fn detect(instruction: &str) -> Self {
        let lower = instruction.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(&["solve", "fix", "debug", "problem", "why does"]) {
            Self::ProblemSolving
        } else if has(&["design", "architect", "structure", "plan out"]) {
            Self::Design
        } else if has(&["analy", "compare", "evaluate", "trade-off", "tradeoff"]) {
            Self::Analytical
        } else {
            Self::General
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            Self::General => {
                "You think carefully before answering and explain your reasoning step by step."
            }
            Self::ProblemSolving => {
                "You are a systematic problem solver. Identify the root cause, list candidate \
                 fixes, and recommend one."
            }
            Self::Design => {
                "You are a software architect. Propose a design, describe its components and \
                 interfaces, and note the main trade-offs."
            }
            Self::Analytical => {
                "You are an analyst. Compare the options against explicit criteria and state a \
                 conclusion."
            }
        }
    }
}

pub struct ThinkerHandler;

#[async_trait]
impl TaskHandler for ThinkerHandler {
    fn name(&self) -> &str {
        "thinker"
    }

    fn description(&self) -> &str {
        "Reasons through problems, designs and comparisons"
    }

    async fn handle(&self, task: &Task, ctx: &HandlerContext) -> TaskResult {
        let mode = ThinkingMode::detect(&task.instruction);
        let generation = ctx.generate(&task.instruction, Some(mode.system_prompt())).await;
        Ok(json!({
            "analysis": generation.text,
            "mode": mode,
            "source": source_json(&generation),
        }))
    }
}
