//! Priority-grouped task scheduler.
//!
//! ```text
//! Pending ──► Grouped ──► Executing(p1) ──► Executing(p2) ──► … ──► Completed
//!                          │ JoinSet fan-out, Semaphore(max_concurrency)
//!                          │ per-task timeout, panics caught
//!                          └ barrier: every task of the group has a result
//! ```
//!
//! Groups run strictly in ascending priority. Inside a group there is no
//! ordering. A failing, panicking or timed-out task never stops its
//! siblings or later groups; it is simply recorded as a [`TaskFailure`].
//!
//! The per-task timeout starts once the task holds a concurrency permit, so
//! time spent queued behind other tasks of the same group is not charged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::handler::{FailureReason, HandlerContext, TaskFailure, TaskResult};
use crate::plan::{Plan, Task};

/// Default number of tasks of one group running at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
/// Default upper bound on a single task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be >= 1".into());
        }
        if self.task_timeout.is_zero() {
            return Err("task_timeout must be non-zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SchedulerPhase {
    Pending,
    Grouped { groups: usize },
    Executing { priority: u32 },
    Completed,
}

/// Progress notifications emitted while a plan runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    PhaseChanged(SchedulerPhase),
    GroupStarted {
        priority: u32,
        task_ids: Vec<String>,
    },
    TaskStarted {
        task_id: String,
        priority: u32,
    },
    TaskFinished {
        task_id: String,
        priority: u32,
        failure: Option<FailureReason>,
    },
    GroupFinished {
        priority: u32,
    },
}

/// Result of one task together with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub handler: String,
    pub priority: u32,
    pub result: TaskResult,
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.result.as_ref().err()
    }

    fn failed(task: &Task, failure: TaskFailure) -> Self {
        Self {
            task_id: task.id.clone(),
            handler: task.handler.clone(),
            priority: task.priority,
            result: Err(failure),
            duration_ms: 0,
        }
    }
}

/// Aggregated results of a whole plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub results: HashMap<String, TaskOutcome>,
    /// Task ids per priority group, in execution order.
    pub groups: Vec<(u32, Vec<String>)>,
    pub duration_ms: u64,
}

impl PlanOutcome {
    pub fn get(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.results.get(task_id)
    }

    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Outcomes in execution order (group order, then plan order).
    pub fn ordered(&self) -> Vec<&TaskOutcome> {
        self.groups
            .iter()
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.results.get(id))
            .collect()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    /// Emit [`SchedulerEvent`]s to `tx` while executing.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn enter(&self, phase: SchedulerPhase) {
        debug!(?phase, "scheduler phase");
        self.emit(SchedulerEvent::PhaseChanged(phase));
    }

    /// Run every task of `plan`. Never fails; per-task problems are recorded
    /// in the returned outcome.
    pub async fn execute(&self, plan: &Plan, ctx: &HandlerContext) -> PlanOutcome {
        let started = Instant::now();
        self.enter(SchedulerPhase::Pending);

        for w in plan.dependency_warnings() {
            warn!(
                task = %w.task_id,
                dependency = %w.dependency,
                issue = ?w.issue,
                "dependency not guaranteed by priority ordering"
            );
        }

        let groups = plan.priority_groups();
        self.enter(SchedulerPhase::Grouped {
            groups: groups.len(),
        });
        info!(
            request_id = %ctx.request_id,
            tasks = plan.len(),
            groups = groups.len(),
            "executing plan"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut outcome = PlanOutcome::default();

        for (priority, tasks) in groups {
            self.enter(SchedulerPhase::Executing { priority });
            let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
            self.emit(SchedulerEvent::GroupStarted {
                priority,
                task_ids: ids.clone(),
            });
            info!(priority, tasks = tasks.len(), "starting priority group");

            let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
            for task in &tasks {
                join_set.spawn(run_task(
                    (*task).clone(),
                    ctx.clone(),
                    semaphore.clone(),
                    self.config.task_timeout,
                    self.events.clone(),
                ));
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(task_outcome) => {
                        outcome
                            .results
                            .insert(task_outcome.task_id.clone(), task_outcome);
                    }
                    Err(e) => warn!(priority, error = %e, "task join failed"),
                }
            }

            for task in &tasks {
                if !outcome.results.contains_key(&task.id) {
                    let failure =
                        TaskFailure::new(FailureReason::Aborted, "task ended without a result");
                    self.emit(SchedulerEvent::TaskFinished {
                        task_id: task.id.clone(),
                        priority,
                        failure: Some(failure.kind),
                    });
                    outcome
                        .results
                        .insert(task.id.clone(), TaskOutcome::failed(task, failure));
                }
            }

            let failed = ids
                .iter()
                .filter(|id| outcome.results.get(*id).is_some_and(|o| !o.is_success()))
                .count();
            info!(priority, failed, "priority group finished");
            self.emit(SchedulerEvent::GroupFinished { priority });
            outcome.groups.push((priority, ids));
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        self.enter(SchedulerPhase::Completed);
        info!(
            succeeded = outcome.succeeded(),
            failed = outcome.failed(),
            duration_ms = outcome.duration_ms,
            "plan completed"
        );
        outcome
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

async fn run_task(
    task: Task,
    ctx: HandlerContext,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
) -> TaskOutcome {
    let emit = |event: SchedulerEvent| {
        if let Some(tx) = &events {
            let _ = tx.send(event);
        }
    };

    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return TaskOutcome::failed(
                &task,
                TaskFailure::new(FailureReason::Aborted, "scheduler semaphore closed"),
            )
        }
    };

    emit(SchedulerEvent::TaskStarted {
        task_id: task.id.clone(),
        priority: task.priority,
    });
    let started = Instant::now();

    let guarded = std::panic::AssertUnwindSafe(ctx.registry.dispatch(&task, &ctx)).catch_unwind();
    let result = match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(TaskFailure::new(
            FailureReason::Panicked,
            panic_message(panic.as_ref()),
        )),
        Err(_) => Err(TaskFailure::new(
            FailureReason::Timeout,
            format!("task exceeded {}s timeout", timeout.as_secs_f64()),
        )),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(_) => debug!(task = %task.id, handler = %task.handler, duration_ms, "task succeeded"),
        Err(f) => warn!(
            task = %task.id,
            handler = %task.handler,
            kind = %f.kind,
            error = %f.message,
            "task failed"
        ),
    }
    emit(SchedulerEvent::TaskFinished {
        task_id: task.id.clone(),
        priority: task.priority,
        failure: result.as_ref().err().map(|f| f.kind),
    });

    TaskOutcome {
        task_id: task.id.clone(),
        handler: task.handler.clone(),
        priority: task.priority,
        result,
        duration_ms,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
