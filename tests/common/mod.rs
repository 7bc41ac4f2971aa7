//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use waypoint::analysis::{
    AggregateStore, AnalysisData, AnalysisPipeline, CreateAggregate, InMemoryAggregateStore,
    InMemoryUnitSource, LoadUnits, ProcessUnits, SeedUnchanged, UnitSource, UpdateAggregate,
    ANALYSIS, REFRESH,
};
use waypoint::checkpoint;
use waypoint::{
    ProcessingError, RetryPolicy, Runner, RunnerBuilder, Task, TaskError, TaskEvent, TaskId,
    TaskStatus, TaskStore, TaskUpdate, UnitContext, UnitFailurePolicy, WorkUnit,
    WorkUnitProcessor,
};

pub const OWNER: &str = "client-1";

/// What the scripted processor does the first time it sees a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Request a pause through the runner, then succeed.
    Pause,
    /// Cancel through the runner, then succeed.
    Cancel,
    /// Fail permanently.
    Fail,
    /// Fail with a retryable error.
    Flaky,
    /// Outlive the unit timeout.
    Hang,
    /// Panic inside the processor.
    Panic,
}

/// Processor that records every call and follows a per-unit script.
pub struct Scripted<S: TaskStore + 'static> {
    calls: Arc<Mutex<Vec<String>>>,
    script: HashMap<String, Action>,
    fired: Mutex<HashSet<String>>,
    runner: Arc<OnceLock<Runner<S>>>,
}

#[async_trait]
impl<S: TaskStore + 'static> WorkUnitProcessor for Scripted<S> {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn process(&self, unit: &WorkUnit, context: &UnitContext) -> Result<Value, ProcessingError> {
        self.calls.lock().unwrap().push(unit.id.clone());

        let action = self
            .script
            .get(&unit.id)
            .copied()
            .filter(|_| self.fired.lock().unwrap().insert(unit.id.clone()));

        let runner = self.runner.get().expect("runner not set");
        match action {
            Some(Action::Pause) => {
                runner.pause(context.task_id).await.unwrap();
            }
            Some(Action::Cancel) => {
                runner.cancel(context.task_id).await.unwrap();
            }
            Some(Action::Fail) => {
                return Err(ProcessingError::permanent(&unit.id, anyhow::anyhow!("malformed unit")));
            }
            Some(Action::Flaky) => {
                return Err(ProcessingError::retryable(&unit.id, anyhow::anyhow!("rate limited")));
            }
            Some(Action::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Some(Action::Panic) => panic!("processor bug on {}", unit.id),
            None => {}
        }

        Ok(json!({ "unit": unit.id, "content": unit.content }))
    }
}

/// Unit source that counts how often it is asked. With a gate set, each
/// load waits for a permit.
#[derive(Default)]
pub struct CountingSource {
    pub inner: InMemoryUnitSource,
    pub loads: AtomicUsize,
    pub gate: Mutex<Option<Arc<Semaphore>>>,
}

#[async_trait]
impl UnitSource for CountingSource {
    async fn load(&self, owner_id: &str, options: &Value) -> anyhow::Result<Vec<WorkUnit>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        self.inner.load(owner_id, options).await
    }
}

pub struct Harness<S: TaskStore + 'static, G: AggregateStore = InMemoryAggregateStore> {
    pub runner: Runner<S>,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub source: Arc<CountingSource>,
    pub aggregates: Arc<G>,
}

pub fn units(ids: &[&str]) -> Vec<WorkUnit> {
    ids.iter()
        .map(|id| WorkUnit::new(*id, json!(format!("content of {id}"))))
        .collect()
}

pub async fn harness<S: TaskStore + 'static>(
    store: S,
    script: &[(&str, Action)],
    policy: UnitFailurePolicy,
) -> Harness<S> {
    harness_with(store, Arc::new(InMemoryAggregateStore::new()), script, policy).await
}

pub async fn harness_with<S: TaskStore + 'static, G: AggregateStore>(
    store: S,
    aggregates: Arc<G>,
    script: &[(&str, Action)],
    policy: UnitFailurePolicy,
) -> Harness<S, G> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let runner_cell = Arc::new(OnceLock::new());
    let processor = Arc::new(Scripted {
        calls: calls.clone(),
        script: script
            .iter()
            .map(|(id, action)| (id.to_string(), *action))
            .collect(),
        fired: Mutex::new(HashSet::new()),
        runner: runner_cell.clone(),
    });

    let source = Arc::new(CountingSource::default());
    source
        .inner
        .set(OWNER, units(&["u1", "u2", "u3", "u4", "u5"]))
        .await;

    let process = || {
        ProcessUnits::new(processor.clone())
            .retry(RetryPolicy::fixed(1, Duration::from_millis(1)))
            .unit_timeout(Duration::from_millis(200))
            .failure_policy(policy)
    };

    let runner = RunnerBuilder::new(store)
        .event_buffer(1024)
        .pipeline(AnalysisPipeline::new(
            ANALYSIS,
            LoadUnits::new(source.clone()),
            process(),
            CreateAggregate::new(aggregates.clone()),
        ))
        .pipeline(AnalysisPipeline::new(
            REFRESH,
            SeedUnchanged::new(source.clone(), aggregates.clone()),
            process(),
            UpdateAggregate::new(aggregates.clone()),
        ))
        .build();
    assert!(runner_cell.set(runner.clone()).is_ok());

    Harness {
        runner,
        calls,
        source,
        aggregates,
    }
}

impl<S: TaskStore + 'static, G: AggregateStore> Harness<S, G> {
    pub async fn start_analysis(&self) -> TaskId {
        self.runner
            .start(ANALYSIS, OWNER, json!({}))
            .await
            .unwrap()
            .id
    }

    pub async fn run(&self, id: TaskId) -> Vec<TaskEvent> {
        self.runner.execute(id).await.unwrap().collect().await
    }

    pub async fn resume(&self, id: TaskId) -> Vec<TaskEvent> {
        self.runner.resume(id).await.unwrap().collect().await
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.runner.status(id).await.unwrap()
    }

    pub async fn data(&self, id: TaskId) -> AnalysisData {
        checkpoint::decode(&self.task(id).await.intermediate_data).unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn loads(&self) -> usize {
        self.source.loads.load(Ordering::SeqCst)
    }
}

pub fn last_kind(events: &[TaskEvent]) -> &'static str {
    events.last().map(TaskEvent::kind).unwrap_or("none")
}

pub fn progress_values(events: &[TaskEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            TaskEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect()
}

/// Behavior every task store must share.
pub async fn store_contract<S: TaskStore>(store: S) {
    let first = store.create("analysis", OWNER, json!({"a": 1})).await.unwrap();
    assert_eq!(first.status, TaskStatus::Pending);
    assert_eq!(first.progress, 0);
    assert_eq!(first.revision, 0);
    assert!(first.completed_steps.is_empty());
    assert_eq!(first.parameters, json!({"a": 1}));

    let second = store.create("refresh", OWNER, json!({})).await.unwrap();
    let other = store.create("analysis", "client-2", json!({})).await.unwrap();
    assert!(second.id > first.id);

    assert!(matches!(
        store.get(TaskId(9999)).await,
        Err(TaskError::NotFound(TaskId(9999)))
    ));

    // Guarded update rejected: nothing is written.
    let rejected = store
        .update(first.id, TaskUpdate::new().progress(50).when(&[TaskStatus::Running]))
        .await;
    assert!(matches!(
        rejected,
        Err(TaskError::Conflict { status: TaskStatus::Pending, .. })
    ));
    assert!(matches!(
        store
            .update(first.id, TaskUpdate::new().status(TaskStatus::Paused))
            .await,
        Err(TaskError::Conflict { .. })
    ));
    assert_eq!(store.get(first.id).await.unwrap().revision, 0);

    let running = store
        .update(
            first.id,
            TaskUpdate::new()
                .status(TaskStatus::Running)
                .when(&[TaskStatus::Pending]),
        )
        .await
        .unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert_eq!(running.revision, 1);

    // Progress never goes down.
    store
        .update(first.id, TaskUpdate::new().current_step("analyze").progress(40))
        .await
        .unwrap();
    let task = store
        .update(first.id, TaskUpdate::new().progress(20))
        .await
        .unwrap();
    assert_eq!(task.progress, 40);
    assert_eq!(task.current_step, "analyze");

    // Checkpoint fields round-trip.
    let data = json!({"version": 1, "data": {"units": [{"id": "u1", "content": "x"}]}});
    let task = store
        .update(
            first.id,
            TaskUpdate::new()
                .completed_steps(vec!["fetch".into()])
                .intermediate_data(data.clone())
                .error("transient"),
        )
        .await
        .unwrap();
    assert_eq!(task.intermediate_data, data);
    assert_eq!(task.error.as_deref(), Some("transient"));
    let task = store
        .update(first.id, TaskUpdate::new().clear_error())
        .await
        .unwrap();
    assert_eq!(task.error, None);
    assert_eq!(store.get(first.id).await.unwrap(), task);

    // Orphans are the running tasks.
    assert_eq!(store.recover_orphans().await.unwrap(), 1);
    let recovered = store.get(first.id).await.unwrap();
    assert_eq!(recovered.status, TaskStatus::Paused);
    assert!(recovered.paused_at.is_some());
    assert_eq!(recovered.completed_steps, vec!["fetch".to_string()]);

    // Final states stay final.
    store
        .update(second.id, TaskUpdate::new().status(TaskStatus::Running))
        .await
        .unwrap();
    store
        .update(second.id, TaskUpdate::new().status(TaskStatus::Completed).progress(100))
        .await
        .unwrap();
    assert!(matches!(
        store
            .update(second.id, TaskUpdate::new().status(TaskStatus::Running))
            .await,
        Err(TaskError::Conflict { status: TaskStatus::Completed, .. })
    ));

    let mine = store.list_by_owner(OWNER, None).await.unwrap();
    assert_eq!(
        mine.iter().map(|t| t.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );
    let refreshes = store.list_by_owner(OWNER, Some("refresh")).await.unwrap();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0].id, second.id);
    assert_eq!(store.list_by_owner("client-2", None).await.unwrap()[0].id, other.id);
}
