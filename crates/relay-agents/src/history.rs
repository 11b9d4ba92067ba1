//! Bounded interaction history shared by a handler across requests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use coordination::orchestrator::truncate_chars;

/// Characters of each side kept when summarising an interaction.
const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub prompt: String,
    pub response: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct InteractionHistory {
    entries: Mutex<VecDeque<Interaction>>,
    capacity: usize,
}

impl InteractionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Interaction>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an interaction, evicting the oldest past capacity.
    pub fn record(&self, prompt: impl Into<String>, response: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Interaction {
            prompt: prompt.into(),
            response: response.into(),
            at: Utc::now(),
        });
    }

    /// Up to `n` most recent interactions, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Interaction> {
        let entries = self.entries();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Prompt-ready digest of the last `n` interactions. Empty when none.
    pub fn summary(&self, n: usize) -> String {
        self.recent(n)
            .iter()
            .map(|i| {
                format!(
                    "User: {}\nAssistant: {}",
                    truncate_chars(&i.prompt, SUMMARY_CHARS),
                    truncate_chars(&i.response, SUMMARY_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

impl Default for InteractionHistory {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let h = InteractionHistory::new(3);
        for i in 0..5 {
            h.record(format!("q{i}"), format!("a{i}"));
        }
        assert_eq!(h.len(), 3);
        let prompts: Vec<String> = h.recent(10).into_iter().map(|i| i.prompt).collect();
        assert_eq!(prompts, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn test_summary_of_last_n() {
        let h = InteractionHistory::default();
        h.record("first", "one");
        h.record("second", "two");
        let s = h.summary(1);
        assert_eq!(s, "User: second\nAssistant: two");
        h.clear();
        assert!(h.summary(3).is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let h = InteractionHistory::new(0);
        h.record("q", "a");
        assert!(h.is_empty());
    }
}
