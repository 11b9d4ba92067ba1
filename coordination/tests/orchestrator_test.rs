//! Orchestrator: planning, fallback plans, consolidation and persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coordination::{
    Backend, BackendError, Exchange, ExchangeStore, FailureReason, GenerationRouter,
    HandlerContext, HandlerRegistry, MemoryExchangeStore, Orchestrator, OrchestratorConfig,
    OrchestratorError, Plan, RouterConfig, StoreError, Task, TaskHandler, TaskResult,
    ValidationMode,
};
use serde_json::{json, Value};

struct Echo {
    name: &'static str,
}

#[async_trait]
impl TaskHandler for Echo {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, task: &Task, _ctx: &HandlerContext) -> TaskResult {
        Ok(json!({ "response": format!("{}: {}", self.name, task.instruction) }))
    }
}

/// Planner returning a fixed payload.
struct FixedPlanner {
    payload: Value,
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for FixedPlanner {
    fn name(&self) -> &str {
        "planner"
    }

    async fn handle(&self, _task: &Task, _ctx: &HandlerContext) -> TaskResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.clone())
    }
}

/// Backend that records prompts and always answers with `reply`.
struct Recording {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Backend for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    async fn call(&self, prompt: &str, _system: Option<&str>) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.reply.clone())
    }
}

struct BrokenStore;

#[async_trait]
impl ExchangeStore for BrokenStore {
    async fn save_exchange(&self, _exchange: &Exchange) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database is down".into()))
    }
}

fn planner(payload: Value) -> Arc<FixedPlanner> {
    Arc::new(FixedPlanner {
        payload,
        calls: AtomicUsize::new(0),
    })
}

fn base_registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(Arc::new(Echo { name: "coder" }))
        .with(Arc::new(Echo { name: "researcher" }))
}

fn offline_orchestrator(registry: HandlerRegistry, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(
        Arc::new(GenerationRouter::offline_only()),
        Arc::new(registry),
        config,
    )
    .unwrap()
}

#[tokio::test]
async fn empty_request_is_rejected() {
    let orch = offline_orchestrator(base_registry(), OrchestratorConfig::default());
    assert!(matches!(
        orch.process("   ").await,
        Err(OrchestratorError::EmptyRequest)
    ));
}

#[tokio::test]
async fn missing_planner_uses_single_task_fallback() {
    let orch = offline_orchestrator(base_registry(), OrchestratorConfig::default());
    let resp = orch.process("write a parser").await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.task_count, 1);
    assert_eq!(resp.used_handlers, vec!["coder"]);
    assert_eq!(resp.response_text, "coder: write a parser");
    assert_eq!(resp.outcomes[0].task_id, "fallback_task");
}

#[tokio::test]
async fn planner_plan_is_executed_by_priority() {
    let plan = planner(json!({
        "plan": [
            { "id": "research", "agent": "researcher", "task": "look it up", "priority": 1 },
            { "id": "implement", "agent": "coder", "task": "write it", "priority": 2,
              "dependencies": ["research"] }
        ]
    }));
    let registry = base_registry().with(plan.clone());
    let config = OrchestratorConfig {
        consolidate: false,
        ..OrchestratorConfig::default()
    };
    let orch = offline_orchestrator(registry, config);

    let resp = orch.process("build a cache").await.unwrap();
    assert_eq!(plan.calls.load(Ordering::SeqCst), 1);
    assert_eq!(resp.used_handlers, vec!["researcher", "coder"]);
    assert_eq!(resp.task_count, 2);
    assert!(resp.failed_tasks.is_empty());
    assert!(resp.response_text.contains("researcher: look it up"));
    assert!(resp.response_text.contains("coder: write it"));
    assert_eq!(resp.plan_repairs, 0);
}

#[tokio::test]
async fn repaired_duplicate_ids_keep_one_result_per_task() {
    let registry = base_registry().with(planner(json!({
        "plan": [
            { "id": "a", "agent": "coder", "task": "first", "priority": 1 },
            { "id": "a_2", "agent": "coder", "task": "second", "priority": 1 },
            { "id": "a", "agent": "coder", "task": "third", "priority": 1 }
        ]
    })));
    let config = OrchestratorConfig {
        consolidate: false,
        ..OrchestratorConfig::default()
    };
    let orch = offline_orchestrator(registry, config);

    let resp = orch.process("three steps").await.unwrap();
    assert_eq!(resp.task_count, 3);
    assert_eq!(resp.outcomes.len(), 3);
    assert_eq!(resp.plan_repairs, 1);
    let mut ids: Vec<&str> = resp.outcomes.iter().map(|o| o.task_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["a", "a_2", "a_3"]);
    for text in ["coder: first", "coder: second", "coder: third"] {
        assert!(resp.response_text.contains(text), "missing {text}");
    }
}

#[tokio::test]
async fn unknown_handler_is_repaired_in_default_mode() {
    let registry = base_registry().with(planner(json!({
        "plan": [{ "id": "s1", "agent": "wizard", "task": "cast", "priority": 1 }]
    })));
    let orch = offline_orchestrator(registry, OrchestratorConfig::default());

    let resp = orch.process("do magic").await.unwrap();
    assert_eq!(resp.used_handlers, vec!["coder"]);
    assert_eq!(resp.plan_repairs, 1);
    assert!(resp.success);
}

#[tokio::test]
async fn strict_mode_falls_back_on_malformed_plan() {
    let registry = base_registry().with(planner(json!({
        "plan": [{ "id": "s1", "agent": "wizard", "task": "cast", "priority": 1 }]
    })));
    let config = OrchestratorConfig {
        validation: ValidationMode::Strict,
        ..OrchestratorConfig::default()
    };
    let orch = offline_orchestrator(registry, config);

    let resp = orch.process("do magic").await.unwrap();
    assert_eq!(resp.outcomes[0].task_id, "fallback_task");
    assert_eq!(resp.response_text, "coder: do magic");
}

#[tokio::test]
async fn garbage_planner_payload_falls_back() {
    let registry = base_registry().with(planner(json!({ "plan": "not a list" })));
    let orch = offline_orchestrator(registry, OrchestratorConfig::default());
    let resp = orch.process("anything").await.unwrap();
    assert_eq!(resp.task_count, 1);
    assert_eq!(resp.used_handlers, vec!["coder"]);
}

#[tokio::test]
async fn consolidation_goes_through_the_router() {
    let backend = Arc::new(Recording {
        reply: "merged answer".into(),
        prompts: Mutex::new(Vec::new()),
    });
    let backends: Vec<Arc<dyn Backend>> = vec![backend.clone()];
    let router = GenerationRouter::new(backends, RouterConfig::default());
    let registry = base_registry();
    let orch = Orchestrator::new(
        Arc::new(router),
        Arc::new(registry),
        OrchestratorConfig::default(),
    )
    .unwrap();

    let plan = Plan::new(vec![
        Task::new("a", "coder", "part one"),
        Task::new("b", "missing", "part two"),
        Task::new("c", "researcher", "part three").with_priority(2),
    ])
    .unwrap();
    let resp = orch.execute_plan(plan, "split work").await;

    assert_eq!(resp.response_text, "merged answer");
    assert_eq!(resp.failed_tasks, vec!["b"]);
    assert!(resp.success);
    let prompts = backend.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("split work"));
    assert!(prompts[0].contains("coder: part one"));
    assert!(prompts[0].contains("handler_not_found"));
}

#[tokio::test]
async fn offline_consolidation_formats_results() {
    let orch = offline_orchestrator(base_registry(), OrchestratorConfig::default());
    let plan = Plan::new(vec![
        Task::new("a", "coder", "one"),
        Task::new("b", "missing", "two"),
    ])
    .unwrap();
    let resp = orch.execute_plan(plan, "req").await;
    assert!(resp.response_text.contains("coder: one"));
    assert!(resp.response_text.contains("Completed with some errors:"));
    let missing = resp.outcomes.iter().find(|o| o.task_id == "b").unwrap();
    assert_eq!(missing.failure().unwrap().kind, FailureReason::HandlerNotFound);
}

#[tokio::test]
async fn all_failures_still_yield_text() {
    let orch = offline_orchestrator(HandlerRegistry::new(), OrchestratorConfig::default());
    let resp = orch.process("hello").await.unwrap();
    assert!(!resp.success);
    assert!(!resp.response_text.is_empty());
    assert_eq!(resp.failed_tasks, vec!["fallback_task"]);
}

#[tokio::test]
async fn exchanges_are_saved() {
    let store = Arc::new(MemoryExchangeStore::new());
    let orch = offline_orchestrator(base_registry(), OrchestratorConfig::default())
        .with_store(store.clone());
    let resp = orch.process_for_user("user-7", "save me").await.unwrap();
    assert_eq!(resp.history_saved, Some(true));

    let saved = store.exchanges();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].user_id, "user-7");
    assert_eq!(saved[0].request, "save me");
    assert_eq!(saved[0].response, resp.response_text);
    assert_eq!(saved[0].request_id, resp.request_id);
}

#[tokio::test]
async fn store_failure_does_not_fail_the_response() {
    let orch = offline_orchestrator(base_registry(), OrchestratorConfig::default())
        .with_store(Arc::new(BrokenStore));
    let resp = orch.process_for_user("user-7", "save me").await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.history_saved, Some(false));
    assert_eq!(resp.response_text, "coder: save me");
}
