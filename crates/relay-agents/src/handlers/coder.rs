//! Coder: writes code, using the file picker for project context.

use async_trait::async_trait;
use coordination::{HandlerContext, Task, TaskHandler, TaskResult};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{extract_code_block, source_json};
use crate::history::InteractionHistory;

const SYSTEM_PROMPT: &str = "You are an expert software engineer. Write correct, idiomatic, \
well-structured code. Put code in a single fenced block tagged with its language, followed \
by a short explanation.";

/// Context files mentioned in the prompt.
const CONTEXT_FILES: usize = 5;
/// Past interactions included in the prompt.
const HISTORY_TURNS: usize = 3;

pub struct CoderHandler {
    history: InteractionHistory,
    use_file_picker: bool,
}

impl Default for CoderHandler {
    fn default() -> Self {
        Self::new(10)
    }
}

impl CoderHandler {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: InteractionHistory::new(max_history),
            use_file_picker: true,
        }
    }

    pub fn without_file_picker(mut self) -> Self {
        self.use_file_picker = false;
        self
    }

    pub fn history(&self) -> &InteractionHistory {
        &self.history
    }

    async fn context_files(&self, task: &Task, ctx: &HandlerContext) -> Vec<String> {
        if !self.use_file_picker || !ctx.registry.contains("file_picker") {
            return Vec::new();
        }
        match ctx.call_handler("file_picker", task).await {
            Ok(payload) => payload["files"]
                .as_array()
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|f| f["path"].as_str().map(str::to_string))
                        .take(CONTEXT_FILES)
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "file picker failed, continuing without context");
                Vec::new()
            }
        }
    }

    fn prompt(&self, instruction: &str, files: &[String]) -> String {
        let mut prompt = String::new();
        let history = self.history.summary(HISTORY_TURNS);
        if !history.is_empty() {
            prompt.push_str(&format!("Earlier in this conversation:\n{history}\n\n"));
        }
        if !files.is_empty() {
            prompt.push_str("Relevant project files:\n");
            for f in files {
                prompt.push_str(&format!("- {f}\n"));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!("Task:\n{instruction}"));
        prompt
    }
}

#[async_trait]
impl TaskHandler for CoderHandler {
    fn name(&self) -> &str {
        "coder"
    }

    fn description(&self) -> &str {
        "Writes, fixes and explains code"
    }

    async fn handle(&self, task: &Task, ctx: &HandlerContext) -> TaskResult {
        let files = self.context_files(task, ctx).await;
        let generation = ctx
            .generate(&self.prompt(&task.instruction, &files), Some(SYSTEM_PROMPT))
            .await;
        let block = extract_code_block(&generation.text);
        debug!(
            task = %task.id,
            has_code = block.is_some(),
            context_files = files.len(),
            "coder finished"
        );

        self.history.record(task.instruction.clone(), generation.text.clone());

        Ok(json!({
            "response": generation.text,
            "code": block.as_ref().map(|b| Value::from(b.code.clone())).unwrap_or(Value::Null),
            "language": block.and_then(|b| b.language),
            "context_files": files,
            "source": source_json(&generation),
        }))
    }
}
