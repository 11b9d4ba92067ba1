use async_trait::async_trait;
use coordination::{HandlerContext, Task, TaskHandler, TaskResult};
use serde_json::json;

use super::source_json;

const SYSTEM_PROMPT: &str = "You are a research assistant. Give an accurate, well-organised \
summary of what is known about the topic, note open questions, and say so when you are unsure.";

pub struct ResearcherHandler;

#[async_trait]
impl TaskHandler for ResearcherHandler {
    fn name(&self) -> &str {
        "researcher"
    }

    fn description(&self) -> &str {
        "Summarises background knowledge on a topic"
    }

    async fn handle(&self, task: &Task, ctx: &HandlerContext) -> TaskResult {
        let prompt = format!(
            "Research the following and summarise the findings:\n\n{}",
            task.instruction
        );
        let generation = ctx.generate(&prompt, Some(SYSTEM_PROMPT)).await;
        Ok(json!({
            "summary": generation.text,
            "query": task.instruction,
            "source": source_json(&generation),
        }))
    }
}
