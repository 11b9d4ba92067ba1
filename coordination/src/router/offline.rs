//! Deterministic last-resort responder.
//!
//! Used when every backend is unusable or failed. Pure function of the
//! prompt; never empty.

/// Maximum number of prompt characters echoed back by the default reply.
pub const ECHO_LIMIT: usize = 100;

const GREETING_WORDS: &[&str] = &["hello", "hi", "hey"];
const CODE_WORDS: &[&str] = &["code", "python", "function", "rust"];
const ERROR_WORDS: &[&str] = &["error", "problem", "issue"];

/// Which canned reply was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineIntent {
    Greeting,
    Code,
    Troubleshooting,
    Echo,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineResponder;

impl OfflineResponder {
    pub fn classify(prompt: &str) -> OfflineIntent {
        let lower = prompt.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has_any = |set: &[&str]| words.iter().any(|w| set.contains(w));

        if has_any(GREETING_WORDS) {
            OfflineIntent::Greeting
        } else if has_any(CODE_WORDS) {
            OfflineIntent::Code
        } else if has_any(ERROR_WORDS) {
            OfflineIntent::Troubleshooting
        } else {
            OfflineIntent::Echo
        }
    }

    pub fn respond(&self, prompt: &str) -> String {
        match Self::classify(prompt) {
            OfflineIntent::Greeting => {
                "Hello! I'm running in offline mode right now, so my answers are limited, \
                 but I'm still here to help."
                    .to_string()
            }
            OfflineIntent::Code => {
                "I can't reach a code-generation backend at the moment. Please describe the \
                 code you need and try again shortly."
                    .to_string()
            }
            OfflineIntent::Troubleshooting => {
                "It sounds like you're dealing with a problem. All generation backends are \
                 unavailable right now; check the error details and retry in a few minutes."
                    .to_string()
            }
            OfflineIntent::Echo => {
                let excerpt: String = prompt.trim().chars().take(ECHO_LIMIT).collect();
                if excerpt.is_empty() {
                    "I'm in offline mode and received an empty request.".to_string()
                } else {
                    format!(
                        "I'm in offline mode and can't generate a full answer. \
                         I received your request: \"{excerpt}\""
                    )
                }
            }
        }
    }
}
