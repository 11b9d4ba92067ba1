//! Reviewer: critiques code or text and lists concrete issues.

use std::sync::LazyLock;

use async_trait::async_trait;
use coordination::{HandlerContext, Task, TaskHandler, TaskResult};
use regex::Regex;
use serde_json::json;

use super::source_json;

const SYSTEM_PROMPT: &str = "You are a meticulous code reviewer. Point out bugs, unsafe \
patterns and unclear code. List each issue as a bullet point, then give an overall verdict.";

static BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*•]|\d+[.)])\s+(.+?)\s*$").expect("BULLET regex should compile")
});

/// Bullet and numbered list items of `text`.
pub fn parse_issues(text: &str) -> Vec<String> {
    BULLET
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

pub struct ReviewerHandler;

#[async_trait]
impl TaskHandler for ReviewerHandler {
    fn name(&self) -> &str {
        "reviewer"
    }

    fn description(&self) -> &str {
        "Reviews code or designs and lists issues"
    }

    async fn handle(&self, task: &Task, ctx: &HandlerContext) -> TaskResult {
        let prompt = format!("Review the following:\n\n{}", task.instruction);
        let generation = ctx.generate(&prompt, Some(SYSTEM_PROMPT)).await;
        let issues = if generation.is_offline() {
            Vec::new()
        } else {
            parse_issues(&generation.text)
        };
        Ok(json!({
            "review": generation.text,
            "issues": issues,
            "source": source_json(&generation),
        }))
    }
}
