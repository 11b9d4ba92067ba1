//! File picker: ranks project files by how well their paths match a query.
//!
//! Walks the project root with `.gitignore` rules applied and hidden entries
//! skipped. Each query term found in a file name scores 3, and each term found
//! in the rest of the path scores 1. No backend is called.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use coordination::{HandlerContext, Task, TaskFailure, TaskHandler, TaskResult};
use ignore::WalkBuilder;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

pub const DEFAULT_MAX_FILES: usize = 20;

const NAME_SCORE: u32 = 3;
const PATH_SCORE: u32 = 1;

const DEFAULT_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "h", "cpp", "hpp", "cs", "rb",
    "php", "swift", "kt", "scala", "sh", "sql", "html", "css", "md", "toml", "yaml", "yml",
    "json",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "how", "what", "which", "add",
    "fix", "make", "write", "code", "file", "files", "please", "can", "you", "should", "use",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoredFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub score: u32,
    pub size: u64,
}

pub struct FilePickerHandler {
    root: PathBuf,
    max_files: usize,
    extensions: Vec<String>,
}

impl FilePickerHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_files: DEFAULT_MAX_FILES,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Lowercase query words longer than two characters, minus stopwords.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 2 && !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Score of one relative path against `terms`.
pub fn score_path(rel_path: &str, terms: &[String]) -> u32 {
    let lower = rel_path.to_lowercase();
    let (dir, name) = match lower.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", lower.as_str()),
    };
    terms
        .iter()
        .map(|t| {
            let mut score = 0;
            if name.contains(t.as_str()) {
                score += NAME_SCORE;
            }
            if dir.contains(t.as_str()) {
                score += PATH_SCORE;
            }
            score
        })
        .sum()
}

/// Every matching file under `root`, best first.
fn rank_files(root: &Path, terms: &[String], extensions: &[String]) -> Vec<ScoredFile> {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build();

    let mut scored = Vec::new();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if !ext.is_some_and(|e| extensions.contains(&e)) {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        let score = score_path(&rel, terms);
        if score == 0 {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        scored.push(ScoredFile { path: rel, score, size });
    }

    scored.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    scored
}

#[async_trait]
impl TaskHandler for FilePickerHandler {
    fn name(&self) -> &str {
        "file_picker"
    }

    fn description(&self) -> &str {
        "Finds project files relevant to the task"
    }

    async fn handle(&self, task: &Task, _ctx: &HandlerContext) -> TaskResult {
        if !self.root.is_dir() {
            return Err(TaskFailure::invalid_input(format!(
                "project root {} is not a directory",
                self.root.display()
            )));
        }

        let terms = query_terms(&task.instruction);
        let root = self.root.clone();
        let extensions = self.extensions.clone();
        let walk_terms = terms.clone();
        let mut ranked =
            tokio::task::spawn_blocking(move || rank_files(&root, &walk_terms, &extensions))
                .await
                .map_err(|e| TaskFailure::failed(format!("file walk failed: {e}")))?;

        let total_found = ranked.len();
        ranked.truncate(self.max_files);
        debug!(terms = ?terms, total_found, returned = ranked.len(), "files picked");

        Ok(json!({
            "files": ranked,
            "query": task.instruction,
            "total_found": total_found,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_terms_drop_short_and_stopwords() {
        assert_eq!(
            query_terms("Fix the router timeout in db.rs"),
            vec!["router", "timeout"]
        );
        assert!(query_terms("a to be").is_empty());
    }

    #[test]
    fn test_repeated_terms_score_once() {
        let terms = query_terms("cache policy cache");
        assert_eq!(terms, vec!["cache", "policy"]);
        assert_eq!(score_path("src/cache.rs", &terms), NAME_SCORE);
    }

    #[test]
    fn test_score_path_weights_name_over_dir() {
        let terms = vec!["router".to_string()];
        assert_eq!(score_path("src/router.rs", &terms), 3);
        assert_eq!(score_path("src/router/mod.rs", &terms), 1);
        assert_eq!(score_path("router/router.rs", &terms), 4);
        assert_eq!(score_path("src/lib.rs", &terms), 0);
    }
}
