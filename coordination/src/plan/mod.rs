//! Plan and task model.
//!
//! A [`Plan`] is an ordered list of [`Task`]s. Execution order is decided
//! by `priority` alone: lower priorities run first, equal priorities run
//! together. `dependencies` are informational; [`Plan::dependency_warnings`]
//! reports the ones that priority ordering does not honour.
//!
//! Plans usually come from a planner's loosely-typed output. [`TaskSpec`]
//! captures that shape and [`Plan::from_specs`] turns it into a valid plan,
//! either repairing malformed entries or rejecting them depending on the
//! [`ValidationMode`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::handler::HandlerRegistry;

/// Id of the single task in a fallback plan.
pub const FALLBACK_TASK_ID: &str = "fallback_task";
/// Instruction used when neither the entry nor the request supplies one.
pub const DEFAULT_INSTRUCTION: &str = "Complete the task";

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```")
        .expect("FENCED_BLOCK regex should compile")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no tasks")]
    Empty,

    #[error("task at index {index} has an empty id")]
    EmptyId { index: usize },

    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    #[error("task '{task_id}' has invalid priority {priority} (must be >= 1)")]
    InvalidPriority { task_id: String, priority: i64 },

    #[error("task at index {index} is missing '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("task '{task_id}' names unknown handler '{handler}'")]
    UnknownHandler { task_id: String, handler: String },

    #[error("could not parse plan: {0}")]
    Parse(String),
}

/// One unit of work. Read-only once the plan is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub handler: String,
    pub instruction: String,
    pub priority: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Task {
    /// A priority-1 task with no dependencies.
    pub fn new(
        id: impl Into<String>,
        handler: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            instruction: instruction.into(),
            priority: 1,
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Loosely-typed task entry as produced by a planner.
///
/// `agent` and `task` are accepted as aliases of `handler` and `instruction`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "agent")]
    pub handler: Option<String>,
    #[serde(default, alias = "task")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl From<&Task> for TaskSpec {
    fn from(task: &Task) -> Self {
        Self {
            id: Some(task.id.clone()),
            handler: Some(task.handler.clone()),
            instruction: Some(task.instruction.clone()),
            priority: Some(i64::from(task.priority)),
            dependencies: task.dependencies.clone(),
            inputs: task.inputs.clone(),
            outputs: task.outputs.clone(),
        }
    }
}

/// How malformed plan entries are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Fill in defaults and record each repair.
    #[default]
    Repair,
    /// Reject the whole plan on the first malformed entry.
    Strict,
}

#[derive(Debug, Clone)]
pub struct PlanBuildOptions {
    pub mode: ValidationMode,
    /// Handler used for entries with a missing or unknown handler.
    pub default_handler: String,
    /// Accepted handler names. `None` accepts any name.
    pub known_handlers: Option<HashSet<String>>,
    /// Original request, used when an entry has no instruction.
    pub request: Option<String>,
}

impl Default for PlanBuildOptions {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Repair,
            default_handler: "coder".to_string(),
            known_handlers: None,
            request: None,
        }
    }
}

/// A correction applied while building a plan in repair mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRepair {
    pub index: usize,
    pub task_id: String,
    pub field: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyIssue {
    /// The dependency names no task in the plan.
    Unknown,
    /// The dependency runs in the same priority group.
    SameGroup,
    /// The dependency runs in a later priority group.
    LaterGroup,
}

/// A declared dependency that priority ordering does not guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyWarning {
    pub task_id: String,
    pub dependency: String,
    pub issue: DependencyIssue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    tasks: Vec<Task>,
    #[serde(default)]
    repairs: Vec<PlanRepair>,
}

impl Plan {
    /// Build a plan from fully-formed tasks.
    pub fn new(tasks: Vec<Task>) -> Result<Self, PlanError> {
        if tasks.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut seen = HashSet::new();
        for (index, task) in tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                return Err(PlanError::EmptyId { index });
            }
            if task.priority == 0 {
                return Err(PlanError::InvalidPriority {
                    task_id: task.id.clone(),
                    priority: 0,
                });
            }
            if !seen.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateId(task.id.clone()));
            }
        }
        Ok(Self {
            tasks,
            repairs: Vec::new(),
        })
    }

    /// Single-task plan handing the whole request to `handler`.
    pub fn fallback(handler: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            tasks: vec![Task::new(FALLBACK_TASK_ID, handler, request)],
            repairs: Vec::new(),
        }
    }

    /// Build a plan from planner output.
    pub fn from_specs(specs: Vec<TaskSpec>, options: &PlanBuildOptions) -> Result<Self, PlanError> {
        if specs.is_empty() {
            return Err(PlanError::Empty);
        }
        let strict = options.mode == ValidationMode::Strict;
        let mut repairs = Vec::new();
        let mut tasks = Vec::with_capacity(specs.len());
        let mut seen: HashSet<String> = HashSet::new();

        for (index, spec) in specs.into_iter().enumerate() {
            let mut repair = |task_id: &str, field: &str, detail: String| {
                repairs.push(PlanRepair {
                    index,
                    task_id: task_id.to_string(),
                    field: field.to_string(),
                    detail,
                });
            };

            let mut id = match spec.id.filter(|s| !s.trim().is_empty()) {
                Some(id) => id.trim().to_string(),
                None if strict => return Err(PlanError::MissingField { index, field: "id" }),
                None => {
                    let id = format!("step_{index}");
                    repair(&id, "id", format!("missing id, assigned '{id}'"));
                    id
                }
            };
            if seen.contains(&id) {
                if strict {
                    return Err(PlanError::DuplicateId(id));
                }
                let renamed = unused_id(&id, index, &seen);
                repair(&renamed, "id", format!("duplicate id '{id}' renamed"));
                id = renamed;
            }
            seen.insert(id.clone());

            let priority = match spec.priority {
                Some(p) if p >= 1 => u32::try_from(p).unwrap_or(u32::MAX),
                Some(p) if strict => {
                    return Err(PlanError::InvalidPriority { task_id: id, priority: p })
                }
                Some(p) => {
                    repair(&id, "priority", format!("priority {p} raised to 1"));
                    1
                }
                None if strict => {
                    return Err(PlanError::MissingField {
                        index,
                        field: "priority",
                    })
                }
                None => {
                    let p = u32::try_from(index + 1).unwrap_or(u32::MAX);
                    repair(&id, "priority", format!("missing priority, assigned {p}"));
                    p
                }
            };

            let handler = match spec.handler.filter(|s| !s.trim().is_empty()) {
                Some(h) => {
                    let h = h.trim().to_string();
                    let known = options
                        .known_handlers
                        .as_ref()
                        .map(|set| set.contains(&h))
                        .unwrap_or(true);
                    if known {
                        h
                    } else if strict {
                        return Err(PlanError::UnknownHandler {
                            task_id: id,
                            handler: h,
                        });
                    } else {
                        let detail = format!(
                            "unknown handler '{h}' replaced by '{}'",
                            options.default_handler
                        );
                        repair(&id, "handler", detail);
                        options.default_handler.clone()
                    }
                }
                None if strict => {
                    return Err(PlanError::MissingField {
                        index,
                        field: "handler",
                    })
                }
                None => {
                    repair(
                        &id,
                        "handler",
                        format!("missing handler, assigned '{}'", options.default_handler),
                    );
                    options.default_handler.clone()
                }
            };

            let instruction = match spec.instruction.filter(|s| !s.trim().is_empty()) {
                Some(text) => text,
                None if strict => {
                    return Err(PlanError::MissingField {
                        index,
                        field: "instruction",
                    })
                }
                None => {
                    repair(&id, "instruction", "missing instruction".to_string());
                    options
                        .request
                        .clone()
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_INSTRUCTION.to_string())
                }
            };

            tasks.push(Task {
                id,
                handler,
                instruction,
                priority,
                dependencies: spec.dependencies,
                inputs: spec.inputs,
                outputs: spec.outputs,
            });
        }

        for r in &repairs {
            warn!(task = %r.task_id, field = %r.field, detail = %r.detail, "plan entry repaired");
        }

        Ok(Self { tasks, repairs })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn repairs(&self) -> &[PlanRepair] {
        &self.repairs
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Tasks grouped by ascending priority, plan order within a group.
    pub fn priority_groups(&self) -> Vec<(u32, Vec<&Task>)> {
        let mut groups: BTreeMap<u32, Vec<&Task>> = BTreeMap::new();
        for task in &self.tasks {
            groups.entry(task.priority).or_default().push(task);
        }
        groups.into_iter().collect()
    }

    /// Distinct handler names in execution order.
    pub fn handler_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for (_, group) in self.priority_groups() {
            for task in group {
                if seen.insert(task.handler.as_str()) {
                    names.push(task.handler.clone());
                }
            }
        }
        names
    }

    pub fn dependency_warnings(&self) -> Vec<DependencyWarning> {
        let priorities: HashMap<&str, u32> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.priority))
            .collect();
        let mut warnings = Vec::new();
        for task in &self.tasks {
            for dep in &task.dependencies {
                let issue = match priorities.get(dep.as_str()) {
                    None => Some(DependencyIssue::Unknown),
                    Some(&p) if p == task.priority => Some(DependencyIssue::SameGroup),
                    Some(&p) if p > task.priority => Some(DependencyIssue::LaterGroup),
                    Some(_) => None,
                };
                if let Some(issue) = issue {
                    warnings.push(DependencyWarning {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                        issue,
                    });
                }
            }
        }
        warnings
    }

    /// `(task_id, handler)` pairs whose handler is not registered.
    pub fn unresolved_handlers(&self, registry: &HandlerRegistry) -> Vec<(String, String)> {
        self.tasks
            .iter()
            .filter(|t| !registry.contains(&t.handler))
            .map(|t| (t.id.clone(), t.handler.clone()))
            .collect()
    }
}

/// First `{base}_{n}` with `n >= index` that is not taken.
fn unused_id(base: &str, index: usize, seen: &HashSet<String>) -> String {
    (index..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !seen.contains(candidate))
        .unwrap_or_else(|| format!("{base}_{}", seen.len()))
}

/// Extract task entries from free-form planner text.
///
/// Looks inside a fenced code block when present, strips control characters,
/// and accepts a JSON array, a single task object, or an object holding the
/// array under `plan`, `steps` or `tasks`. Entries that are not objects of
/// the expected shape are skipped.
pub fn parse_plan_text(text: &str) -> Result<Vec<TaskSpec>, PlanError> {
    let body = FENCED_BLOCK
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);
    let cleaned: String = body
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();
    let cleaned = cleaned.trim();

    let value: serde_json::Value = match serde_json::from_str(cleaned) {
        Ok(v) => v,
        Err(first_err) => match slice_json(cleaned) {
            Some(slice) => serde_json::from_str(slice)
                .map_err(|e| PlanError::Parse(e.to_string()))?,
            None => return Err(PlanError::Parse(first_err.to_string())),
        },
    };

    let entries = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => {
            let wrapper = ["plan", "steps", "tasks"]
                .iter()
                .find_map(|k| match map.get(*k) {
                    Some(serde_json::Value::Array(items)) => Some(items.clone()),
                    _ => None,
                });
            wrapper.unwrap_or_else(|| vec![serde_json::Value::Object(map)])
        }
        other => return Err(PlanError::Parse(format!("expected array or object, got {other}"))),
    };

    let specs: Vec<TaskSpec> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| match serde_json::from_value::<TaskSpec>(entry) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(index = i, error = %e, "skipping malformed plan entry");
                None
            }
        })
        .collect();

    if specs.is_empty() {
        return Err(PlanError::Empty);
    }
    Ok(specs)
}

fn slice_json(text: &str) -> Option<&str> {
    let (open, close) = match (text.find('['), text.find('{')) {
        (Some(a), Some(o)) if a < o => ('[', ']'),
        (Some(_), None) => ('[', ']'),
        (_, Some(_)) => ('{', '}'),
        (None, None) => return None,
    };
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, handler: &str, priority: i64) -> TaskSpec {
        TaskSpec {
            id: Some(id.into()),
            handler: Some(handler.into()),
            instruction: Some(format!("do {id}")),
            priority: Some(priority),
            ..TaskSpec::default()
        }
    }

    #[test]
    fn test_new_rejects_zero_priority() {
        let err = Plan::new(vec![Task::new("a", "echo", "x").with_priority(0)]).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPriority { .. }));
    }

    #[test]
    fn test_new_rejects_duplicate_ids() {
        let err = Plan::new(vec![Task::new("a", "echo", "x"), Task::new("a", "echo", "y")])
            .unwrap_err();
        assert_eq!(err, PlanError::DuplicateId("a".into()));
    }

    #[test]
    fn test_groups_sorted_by_priority() {
        let plan = Plan::new(vec![
            Task::new("late", "echo", "x").with_priority(3),
            Task::new("a", "echo", "x"),
            Task::new("mid", "echo", "x").with_priority(2),
            Task::new("b", "echo", "x"),
        ])
        .unwrap();
        let groups: Vec<(u32, Vec<&str>)> = plan
            .priority_groups()
            .into_iter()
            .map(|(p, ts)| (p, ts.into_iter().map(|t| t.id.as_str()).collect()))
            .collect();
        assert_eq!(
            groups,
            vec![(1, vec!["a", "b"]), (2, vec!["mid"]), (3, vec!["late"])]
        );
    }

    #[test]
    fn test_repair_fills_defaults() {
        let specs = vec![
            TaskSpec::default(),
            TaskSpec {
                id: Some("x".into()),
                handler: Some("wizard".into()),
                priority: Some(0),
                ..TaskSpec::default()
            },
        ];
        let options = PlanBuildOptions {
            known_handlers: Some(["coder".to_string()].into_iter().collect()),
            request: Some("build a thing".into()),
            ..PlanBuildOptions::default()
        };
        let plan = Plan::from_specs(specs, &options).unwrap();
        let first = &plan.tasks()[0];
        assert_eq!(first.id, "step_0");
        assert_eq!(first.priority, 1);
        assert_eq!(first.handler, "coder");
        assert_eq!(first.instruction, "build a thing");

        let second = &plan.tasks()[1];
        assert_eq!(second.priority, 1);
        assert_eq!(second.handler, "coder");
        assert!(plan.repairs().iter().any(|r| r.task_id == "x" && r.field == "handler"));
    }

    #[test]
    fn test_repair_renames_duplicates() {
        let plan = Plan::from_specs(
            vec![spec("a", "coder", 1), spec("a", "coder", 2)],
            &PlanBuildOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.tasks()[1].id, "a_1");
    }

    #[test]
    fn test_repair_rename_skips_taken_ids() {
        let plan = Plan::from_specs(
            vec![spec("a", "coder", 1), spec("a_2", "coder", 1), spec("a", "coder", 1)],
            &PlanBuildOptions::default(),
        )
        .unwrap();
        let ids: Vec<&str> = plan.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a_2", "a_3"]);
        assert_eq!(plan.repairs().len(), 1);
    }

    #[test]
    fn test_repair_generated_id_does_not_collide() {
        let unnamed = TaskSpec {
            handler: Some("coder".into()),
            instruction: Some("do it".into()),
            priority: Some(1),
            ..TaskSpec::default()
        };
        let plan = Plan::from_specs(
            vec![spec("step_1", "coder", 1), unnamed, spec("step_1_1", "coder", 1)],
            &PlanBuildOptions::default(),
        )
        .unwrap();
        let ids: HashSet<&str> = plan.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(plan.tasks()[1].id, "step_1_1");
        assert_eq!(plan.tasks()[2].id, "step_1_1_2");
    }

    #[test]
    fn test_strict_rejects_malformed() {
        let options = PlanBuildOptions {
            mode: ValidationMode::Strict,
            known_handlers: Some(["coder".to_string()].into_iter().collect()),
            ..PlanBuildOptions::default()
        };
        let err = Plan::from_specs(vec![spec("a", "wizard", 1)], &options).unwrap_err();
        assert!(matches!(err, PlanError::UnknownHandler { .. }));

        let err = Plan::from_specs(vec![spec("a", "coder", -2)], &options).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPriority { priority: -2, .. }));

        let ok = Plan::from_specs(vec![spec("a", "coder", 1)], &options).unwrap();
        assert!(ok.repairs().is_empty());
    }

    #[test]
    fn test_dependency_warnings() {
        let plan = Plan::new(vec![
            Task::new("a", "echo", "x"),
            Task::new("b", "echo", "x").with_dependencies(["a"]),
            Task::new("c", "echo", "x")
                .with_priority(2)
                .with_dependencies(["a", "ghost"]),
            Task::new("d", "echo", "x").with_dependencies(["c"]),
        ])
        .unwrap();
        let warnings = plan.dependency_warnings();
        assert_eq!(warnings.len(), 3);
        assert!(warnings
            .iter()
            .any(|w| w.task_id == "b" && w.issue == DependencyIssue::SameGroup));
        assert!(warnings
            .iter()
            .any(|w| w.dependency == "ghost" && w.issue == DependencyIssue::Unknown));
        assert!(warnings
            .iter()
            .any(|w| w.task_id == "d" && w.issue == DependencyIssue::LaterGroup));
    }

    #[test]
    fn test_parse_fenced_array() {
        let text = "Here is the plan:\n```json\n\
                    [{\"id\":\"s1\",\"agent\":\"coder\",\"task\":\"write it\",\"priority\":1}]\n\
                    ```\nDone.";
        let specs = parse_plan_text(text).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].handler.as_deref(), Some("coder"));
        assert_eq!(specs[0].instruction.as_deref(), Some("write it"));
    }

    #[test]
    fn test_parse_single_object_and_wrapper() {
        let single = parse_plan_text(r#"{"id":"only","handler":"coder"}"#).unwrap();
        assert_eq!(single.len(), 1);

        let wrapped =
            parse_plan_text(r#"{"plan":[{"id":"a"},{"id":"b","priority":2}]}"#).unwrap();
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped[1].priority, Some(2));
    }

    #[test]
    fn test_parse_embedded_json_with_prose() {
        let specs =
            parse_plan_text(r#"Sure! [{"id":"a","handler":"coder"}] hope that helps"#).unwrap();
        assert_eq!(specs[0].id.as_deref(), Some("a"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_plan_text("no json here"), Err(PlanError::Parse(_))));
        assert!(matches!(parse_plan_text("[]"), Err(PlanError::Empty)));
    }

    #[test]
    fn test_fallback_plan() {
        let plan = Plan::fallback("coder", "do everything");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks()[0].id, FALLBACK_TASK_ID);
        assert_eq!(plan.tasks()[0].priority, 1);
        assert_eq!(plan.handler_names(), vec!["coder".to_string()]);
    }
}
