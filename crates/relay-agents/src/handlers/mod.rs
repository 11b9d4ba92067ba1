//! Concrete task handlers.
//!
//! | Name          | Calls a backend | Payload keys                              |
//! |---------------|-----------------|-------------------------------------------|
//! | `planner`     | yes             | `plan`                                    |
//! | `coder`       | yes             | `response`, `code`, `language`, `context_files` |
//! | `researcher`  | yes             | `summary`, `query`                        |
//! | `reviewer`    | yes             | `review`, `issues`                        |
//! | `thinker`     | yes             | `analysis`, `mode`                        |
//! | `file_picker` | no              | `files`, `query`, `total_found`           |

pub mod coder;
pub mod file_picker;
pub mod planner;
pub mod researcher;
pub mod reviewer;
pub mod thinker;

use std::sync::{Arc, LazyLock};

use coordination::{Generation, HandlerRegistry};
use regex::Regex;
use serde_json::{json, Value};

use crate::config::RelayConfig;

pub use coder::CoderHandler;
pub use file_picker::FilePickerHandler;
pub use planner::PlannerHandler;
pub use researcher::ResearcherHandler;
pub use reviewer::ReviewerHandler;
pub use thinker::ThinkerHandler;

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\n(.*?)```")
        .expect("CODE_BLOCK regex should compile")
});

/// A fenced code block pulled out of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub code: String,
}

/// First fenced code block in `text`.
pub fn extract_code_block(text: &str) -> Option<CodeBlock> {
    let caps = CODE_BLOCK.captures(text)?;
    let language = caps
        .get(1)
        .map(|m| m.as_str().trim().to_lowercase())
        .filter(|l| !l.is_empty());
    let code = caps.get(2)?.as_str().trim_end().to_string();
    Some(CodeBlock { language, code })
}

/// `source` field recorded in every generated payload.
pub(crate) fn source_json(generation: &Generation) -> Value {
    match generation.backend_name() {
        Some(name) => json!(name),
        None => json!("offline"),
    }
}

/// Registry with every handler, wired from `config`.
pub fn default_registry(config: &RelayConfig) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(Arc::new(PlannerHandler::default()))
        .with(Arc::new(CoderHandler::new(config.max_history)))
        .with(Arc::new(ResearcherHandler))
        .with(Arc::new(ReviewerHandler))
        .with(Arc::new(ThinkerHandler))
        .with(Arc::new(FilePickerHandler::new(config.project_root.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_code_block_with_language() {
        let text = "Here you go:\n```Rust\nfn main() {}\n```\nEnjoy.";
        let block = extract_code_block(text).unwrap();
        assert_eq!(block.language.as_deref(), Some("rust"));
        assert_eq!(block.code, "fn main() {}");
    }

    #[test]
    fn test_extract_code_block_without_language() {
        let block = extract_code_block("```\nprint('hi')\n```").unwrap();
        assert_eq!(block.language, None);
        assert_eq!(block.code, "print('hi')");
        assert!(extract_code_block("no code here").is_none());
    }

    #[test]
    fn test_default_registry_names() {
        let registry = default_registry(&RelayConfig::default());
        assert_eq!(
            registry.names(),
            vec!["coder", "file_picker", "planner", "researcher", "reviewer", "thinker"]
        );
    }
}
