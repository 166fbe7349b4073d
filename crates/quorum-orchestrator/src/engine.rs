use crate::arbiter::ResultArbiter;
use crate::board::{Claim, TaskBoard};
use crate::cancel::CancelToken;
use crate::catalog::{CapabilityCatalog, WorkerSnapshot};
use crate::config::EngineConfig;
use crate::envelope::ExecutionEnvelope;
use crate::events::{EngineEvent, EventBus};
use crate::patterns::{fold_dependencies, select_pattern, Aggregator, PatternExecutor};
use crate::recorder::OutcomeRecorder;
use crate::store::{CatalogStore, FileCatalogStore, JsonlOutcomeLog, OutcomeLog};
use crate::strategy::StrategyArbiter;
use crate::types::{OrchestrationPattern, Outcome, Task, WorkerStatus};
use crate::worker::{Worker, WorkerFactory};
use parking_lot::RwLock;
use quorum_core::{AttemptError, ErrorKind, QuorumError, QuorumResult};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STOP_POLL: Duration = Duration::from_millis(10);

/// Durable backing for the catalog and the outcome log.
#[derive(Default)]
pub struct Persistence {
    /// Where worker registrations are saved; `None` keeps the catalog in memory.
    pub catalog_store: Option<Arc<dyn CatalogStore>>,
    /// Where completed outcomes are appended.
    pub outcome_log: Option<Arc<dyn OutcomeLog>>,
    /// Rebuilds workers from reloaded registrations at start.
    pub factory: Option<Arc<dyn WorkerFactory>>,
}

impl Persistence {
    /// `dir/workers/` for registrations and `dir/outcomes.jsonl` for outcomes.
    pub async fn file_backed(dir: &Path, factory: Option<Arc<dyn WorkerFactory>>) -> QuorumResult<Self> {
        let catalog_store = FileCatalogStore::new(dir.join("workers")).await?;
        let outcome_log = JsonlOutcomeLog::new(dir.join("outcomes.jsonl")).await?;
        Ok(Self {
            catalog_store: Some(Arc::new(catalog_store)),
            outcome_log: Some(Arc::new(outcome_log)),
            factory,
        })
    }
}

/// Lifecycle of an [`Orchestrator`]. It only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Built, not yet started. Workers may be registered.
    Created,
    /// Accepting tasks.
    Running,
    /// `stop()` is draining work; new tasks are rejected.
    Stopping,
    /// Shut down. Terminal.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "created"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// Lifecycle state at snapshot time.
    pub state: EngineState,
    /// One entry per registered worker.
    pub workers: Vec<WorkerSnapshot>,
    /// Staged tasks still waiting for an outcome.
    pub staged_tasks: usize,
    /// Cached outcomes.
    pub outcomes: usize,
    /// Orchestrations currently being run.
    pub active: usize,
    /// Attempts currently holding a load slot.
    pub in_flight: usize,
}

/// The caller-facing engine: owns the catalog, runs tasks, records outcomes.
pub struct Orchestrator {
    config: EngineConfig,
    catalog: Arc<CapabilityCatalog>,
    executor: PatternExecutor,
    recorder: Arc<OutcomeRecorder>,
    board: RwLock<TaskBoard>,
    events: EventBus,
    state: RwLock<EngineState>,
    factory: Option<Arc<dyn WorkerFactory>>,
    shutdown: CancelToken,
    active: AtomicUsize,
}

/// Counts one running orchestration for the shutdown drain.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases a task claim on every exit path, including a dropped future.
struct ClaimGuard<'a> {
    board: &'a RwLock<TaskBoard>,
    task_id: Uuid,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.board.write().finish(self.task_id);
    }
}

impl Orchestrator {
    /// An engine with an in-memory catalog and no outcome log.
    pub fn new(config: EngineConfig) -> QuorumResult<Self> {
        Self::with_persistence(config, Persistence::default())
    }

    /// An engine over the given stores; validates `config` first.
    pub fn with_persistence(config: EngineConfig, persistence: Persistence) -> QuorumResult<Self> {
        config.validate()?;
        let events = EventBus::new(&config.events);
        let catalog = Arc::new(CapabilityCatalog::new(
            config.catalog_settings(),
            persistence.catalog_store,
            events.clone(),
        ));
        let arbiter = ResultArbiter::new(config.arbitration.clone());
        let shutdown = CancelToken::new();
        let executor = PatternExecutor::new(
            ExecutionEnvelope::new(catalog.clone(), config.default_timeout()),
            arbiter,
            catalog.clone(),
            config.executor_settings(),
        )
        .with_halt(shutdown.clone());
        let recorder = Arc::new(OutcomeRecorder::new(
            catalog.clone(),
            persistence.outcome_log,
            config.ema_alpha,
            config.recorder_queue_capacity,
        ));
        let board = TaskBoard::new(config.outcome_cache_capacity);

        Ok(Self {
            config,
            catalog,
            executor,
            recorder,
            board: RwLock::new(board),
            events,
            state: RwLock::new(EngineState::Created),
            factory: persistence.factory,
            shutdown,
            active: AtomicUsize::new(0),
        })
    }

    /// The config the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The worker catalog.
    pub fn catalog(&self) -> &Arc<CapabilityCatalog> {
        &self.catalog
    }

    /// The outcome recorder; `flush()` it to observe learned rates.
    pub fn recorder(&self) -> &Arc<OutcomeRecorder> {
        &self.recorder
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Restore persisted workers, start the outcome recorder and accept tasks.
    pub async fn start(&self) -> QuorumResult<()> {
        match self.state() {
            EngineState::Created => {}
            EngineState::Running => return Ok(()),
            other => {
                return Err(QuorumError::Lifecycle(format!(
                    "cannot start an engine that is {other}"
                )))
            }
        }

        if let Some(factory) = &self.factory {
            let restored = self
                .catalog
                .reload(factory.as_ref(), self.config.health_check_interval())
                .await?;
            if restored > 0 {
                info!(restored, "Restored persisted workers");
            }
        }

        self.recorder.start();
        *self.state.write() = EngineState::Running;
        info!(workers = self.catalog.len(), "Orchestrator started");
        self.events.emit(EngineEvent::Started);
        Ok(())
    }

    /// Stop accepting tasks, cancel and drain running orchestrations, and
    /// flush the recorder.
    ///
    /// Orchestrations stop dispatching new attempts at once; attempts already
    /// running get up to the shutdown timeout to settle.
    pub async fn stop(&self) -> QuorumResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                EngineState::Running => *state = EngineState::Stopping,
                EngineState::Created => {
                    *state = EngineState::Stopped;
                    return Ok(());
                }
                EngineState::Stopping | EngineState::Stopped => return Ok(()),
            }
        }

        self.shutdown.cancel();
        let deadline = Instant::now() + self.config.shutdown_timeout();
        while (self.active_count() > 0 || self.catalog.total_load() > 0) && Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
        }
        let active = self.active_count();
        if active > 0 {
            warn!(
                active,
                timeout_ms = self.config.shutdown_timeout_ms,
                "Shutdown timeout reached with orchestrations still running"
            );
        }
        let stranded = self.catalog.in_flight();
        if !stranded.is_empty() {
            warn!(
                stranded = stranded.len(),
                timeout_ms = self.config.shutdown_timeout_ms,
                "Shutdown timeout reached with attempts still in flight"
            );
        }

        self.recorder.flush().await;
        self.catalog.shutdown();
        *self.state.write() = EngineState::Stopped;
        info!("Orchestrator stopped");
        self.events.emit(EngineEvent::Stopped);
        Ok(())
    }

    /// Add a worker to the catalog. Allowed before `start()`, not after `stop()`.
    pub async fn register_worker(&self, worker: Arc<dyn Worker>) -> QuorumResult<()> {
        if self.state() == EngineState::Stopped {
            return Err(QuorumError::Lifecycle(
                "cannot register workers on a stopped engine".into(),
            ));
        }
        self.catalog
            .register(worker, self.config.health_check_interval())
            .await
    }

    /// Drain and remove a worker. Returns `false` if it was not registered.
    pub async fn deregister_worker(&self, worker_id: &str) -> QuorumResult<bool> {
        self.catalog
            .deregister(worker_id, self.config.drain_timeout())
            .await
    }

    /// Explicit lifecycle change, such as taking a worker into maintenance.
    pub fn set_worker_status(&self, worker_id: &str, status: WorkerStatus) -> QuorumResult<()> {
        self.catalog.set_status(worker_id, status)
    }

    /// Make a scatter-gather aggregator available by name.
    pub fn register_aggregator(&self, name: impl Into<String>, aggregator: Arc<dyn Aggregator>) {
        self.executor.register_aggregator(name, aggregator);
    }

    /// A strategy arbiter sharing this engine's arbitration policy and priors.
    pub fn strategy_arbiter(&self) -> StrategyArbiter {
        StrategyArbiter::new(
            self.executor.arbiter().clone(),
            self.recorder.clone(),
            self.config.default_timeout(),
        )
    }

    /// Receive engine events. Fails once the subscriber limit is reached.
    pub fn subscribe(&self) -> QuorumResult<broadcast::Receiver<EngineEvent>> {
        self.events.subscribe()
    }

    /// Stage a task that others can name as a dependency.
    pub fn stage_task(&self, task: Task) -> QuorumResult<Uuid> {
        validate_task(&task)?;
        self.board.write().add(task)
    }

    /// The cached outcome of a finished task.
    pub fn outcome(&self, task_id: Uuid) -> Option<Outcome> {
        self.board.read().outcome(task_id).cloned()
    }

    /// [`submit_task_with_cancel`](Self::submit_task_with_cancel) without a caller token.
    pub async fn submit_task(&self, task: Task) -> QuorumResult<Outcome> {
        self.submit_task_with_cancel(task, CancelToken::new()).await
    }

    /// Run a task to its outcome.
    ///
    /// Only setup problems are returned as errors: an invalid task, a
    /// dependency cycle, no capable worker, or a lifecycle violation. Every
    /// failure during execution is reported inside the [`Outcome`].
    pub async fn submit_task_with_cancel(&self, task: Task, cancel: CancelToken) -> QuorumResult<Outcome> {
        let _active = self.enter()?;
        validate_task(&task)?;

        let task_id = task.id;
        let _claim = {
            let mut board = self.board.write();
            if board.outcome(task_id).is_some() {
                return Err(QuorumError::Validation(format!(
                    "task {task_id} already has an outcome"
                )));
            }
            if let Claim::Running(_) = board.begin(task_id) {
                return Err(QuorumError::Validation(format!(
                    "task {task_id} is already running"
                )));
            }
            ClaimGuard {
                board: &self.board,
                task_id,
            }
        };

        self.run_with_dependencies(task, &cancel).await
    }

    /// Count an orchestration as active, if the engine is running.
    ///
    /// The state check and the increment happen under the state lock, so
    /// `stop()` either rejects the task or waits for it.
    fn enter(&self) -> QuorumResult<ActiveGuard<'_>> {
        let state = self.state.read();
        if *state != EngineState::Running {
            return Err(QuorumError::Lifecycle(format!(
                "engine is {}, tasks are accepted only while running",
                *state
            )));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(ActiveGuard(&self.active))
    }

    fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn run_with_dependencies(&self, task: Task, cancel: &CancelToken) -> QuorumResult<Outcome> {
        let pending = self
            .board
            .read()
            .check_dependencies(&task, self.config.max_dependency_depth)?;

        for dep_id in pending {
            debug!(task_id = %task.id, dependency = %dep_id, "Resolving dependency");
            self.resolve_dependency(dep_id, cancel).await?;
        }

        self.run_single(task, cancel).await
    }

    /// Make sure a staged dependency has exactly one outcome.
    ///
    /// The first submission to claim the dependency runs it; concurrent
    /// submissions wait for that run and reuse its outcome.
    async fn resolve_dependency(&self, dep_id: Uuid, cancel: &CancelToken) -> QuorumResult<()> {
        loop {
            let claim = {
                let mut board = self.board.write();
                if board.outcome(dep_id).is_some() {
                    return Ok(());
                }
                board.begin(dep_id)
            };

            match claim {
                Claim::Running(mut done) => {
                    debug!(dependency = %dep_id, "Waiting for dependency claimed by another submission");
                    // An Err means the claim holder is gone; either way re-check.
                    let _ = done.wait_for(|finished| *finished).await;
                }
                Claim::Acquired => {
                    let _claim = ClaimGuard {
                        board: &self.board,
                        task_id: dep_id,
                    };
                    let dep_task = {
                        let board = self.board.read();
                        if board.outcome(dep_id).is_some() {
                            return Ok(());
                        }
                        board.get(dep_id).cloned()
                    };
                    let dep_task = dep_task.ok_or_else(|| {
                        QuorumError::Validation(format!("unknown dependency {dep_id}"))
                    })?;
                    return match self.run_single(dep_task, cancel).await {
                        Ok(_) => Ok(()),
                        Err(e) if e.is_setup_error() => {
                            let outcome = Outcome::failed(
                                dep_id,
                                Some(OrchestrationPattern::Hierarchical),
                                vec![AttemptError::from(&e)],
                                format!("dependency could not be dispatched: {e}"),
                            );
                            self.finalize(&outcome);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                }
            }
        }
    }

    /// Execute one task whose dependencies all have outcomes.
    async fn run_single(&self, mut task: Task, cancel: &CancelToken) -> QuorumResult<Outcome> {
        let started = Instant::now();
        let resolved: Vec<(Uuid, Outcome)> = {
            let board = self.board.read();
            if let Some(cached) = board.outcome(task.id) {
                return Ok(cached.clone());
            }
            task.dependencies
                .iter()
                .filter_map(|id| board.outcome(*id).map(|o| (*id, o.clone())))
                .collect()
        };

        let failed: Vec<&(Uuid, Outcome)> = resolved.iter().filter(|(_, o)| !o.success).collect();
        if !failed.is_empty() {
            let mut errors = Vec::new();
            for (id, outcome) in &failed {
                errors.push(AttemptError::new(
                    ErrorKind::Validation,
                    format!("dependency {id} failed"),
                ));
                errors.extend(outcome.errors.iter().cloned());
            }
            let mut outcome = Outcome::failed(
                task.id,
                Some(OrchestrationPattern::Hierarchical),
                errors,
                format!("{} dependency(ies) failed, task not dispatched", failed.len()),
            );
            outcome.wall_time_ms = started.elapsed().as_millis() as u64;
            self.finalize(&outcome);
            return Ok(outcome);
        }

        let candidates = self.catalog.find_candidates(&task.task_type)?;
        let pattern = select_pattern(&task, candidates.len(), self.config.priority_threshold);
        task.context.orchestration_pattern = Some(pattern);
        if !task.dependencies.is_empty() {
            task = fold_dependencies(&task, &resolved);
        }

        let mut outcome = self
            .executor
            .execute(&task, pattern, &candidates, cancel)
            .await?;
        outcome.wall_time_ms = started.elapsed().as_millis() as u64;
        self.finalize(&outcome);
        Ok(outcome)
    }

    fn finalize(&self, outcome: &Outcome) {
        self.board.write().record_outcome(outcome.clone());
        self.recorder.record(outcome);

        match &outcome.winner {
            Some(winner) => {
                info!(
                    task_id = %outcome.task_id,
                    worker_id = %winner.worker_id,
                    confidence = outcome.confidence,
                    wall_time_ms = outcome.wall_time_ms,
                    "Task completed"
                );
                self.events.emit(EngineEvent::TaskCompleted {
                    task_id: outcome.task_id,
                    worker_id: winner.worker_id.clone(),
                    confidence: outcome.confidence,
                    pattern: outcome.pattern,
                });
            }
            None => {
                warn!(
                    task_id = %outcome.task_id,
                    errors = outcome.errors.len(),
                    rationale = %outcome.rationale,
                    "Task failed"
                );
                self.events.emit(EngineEvent::TaskFailed {
                    task_id: outcome.task_id,
                    errors: outcome.errors.len(),
                    pattern: outcome.pattern,
                });
            }
        }
    }

    /// Point-in-time view of the engine, its workers and its task board.
    pub fn snapshot(&self) -> EngineSnapshot {
        let board = self.board.read();
        EngineSnapshot {
            state: self.state(),
            workers: self.catalog.snapshot(),
            staged_tasks: board.staged_count(),
            outcomes: board.outcome_count(),
            active: self.active_count(),
            in_flight: self.catalog.total_load(),
        }
    }

    /// [`snapshot`](Self::snapshot) as pretty JSON.
    pub fn to_json(&self) -> QuorumResult<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }
}

fn validate_task(task: &Task) -> QuorumResult<()> {
    if task.task_type.trim().is_empty() {
        return Err(QuorumError::Validation(format!(
            "task {} has an empty type",
            task.id
        )));
    }
    if task.priority > 10 {
        return Err(QuorumError::Validation(format!(
            "task {} priority {} is outside 0..=10",
            task.id, task.priority
        )));
    }
    if task.dependencies.contains(&task.id) {
        return Err(QuorumError::DependencyCycle(format!("{} -> {}", task.id, task.id)));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedWorker;

    fn config() -> EngineConfig {
        EngineConfig {
            default_timeout_ms: 500,
            health_check_interval_ms: 0,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_submit_requires_running() {
        let engine = Orchestrator::new(config()).unwrap();
        let err = engine
            .submit_task(Task::new("login", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lifecycle);

        engine.start().await.unwrap();
        engine.stop().await.unwrap();
        let err = engine
            .submit_task(Task::new("login", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lifecycle);
        assert_eq!(engine.start().await.unwrap_err().kind(), ErrorKind::Lifecycle);
    }

    #[tokio::test]
    async fn test_outcome_cached_and_resubmit_rejected() {
        let engine = Orchestrator::new(config()).unwrap();
        engine
            .register_worker(ScriptedWorker::new("w1", "login", 5).arc())
            .await
            .unwrap();
        engine.start().await.unwrap();

        let task = Task::new("login", serde_json::Value::Null);
        let outcome = engine.submit_task(task.clone()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.pattern, Some(OrchestrationPattern::Sequential));
        assert_eq!(engine.outcome(task.id), Some(outcome));

        let err = engine.submit_task(task).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_invalid_tasks_rejected() {
        let engine = Orchestrator::new(config()).unwrap();
        engine.start().await.unwrap();

        let err = engine
            .submit_task(Task::new("  ", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = engine
            .submit_task(Task::new("login", serde_json::Value::Null).with_priority(11))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = engine
            .submit_task(Task::new("login", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCapableWorker);
    }

    #[tokio::test]
    async fn test_hierarchical_folds_dependency_payloads() {
        let engine = Orchestrator::new(config()).unwrap();
        engine
            .register_worker(ScriptedWorker::new("fetcher", "fetch", 5).arc())
            .await
            .unwrap();
        engine
            .register_worker(ScriptedWorker::new("parser", "parse", 5).arc())
            .await
            .unwrap();
        engine.start().await.unwrap();

        let fetch = Task::new("fetch", serde_json::json!({"url": "https://example.org"}));
        let fetch_id = engine.stage_task(fetch).unwrap();
        let parse = Task::new("parse", serde_json::json!("html")).with_dependencies(vec![fetch_id]);

        let outcome = engine.submit_task(parse).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.pattern, Some(OrchestrationPattern::Hierarchical));
        let payload = &outcome.winner.as_ref().unwrap().payload["input"];
        assert_eq!(payload["input"], "html");
        assert_eq!(
            payload["dependencies"][fetch_id.to_string()]["worker"],
            "fetcher"
        );
        assert!(engine.outcome(fetch_id).unwrap().success);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dispatch() {
        let engine = Orchestrator::new(config()).unwrap();
        engine
            .register_worker(ScriptedWorker::new("fetcher", "fetch", 5).failing("timeout upstream").arc())
            .await
            .unwrap();
        let parser = ScriptedWorker::new("parser", "parse", 5);
        let parser_calls = parser.call_counter();
        engine.register_worker(parser.arc()).await.unwrap();
        engine.start().await.unwrap();

        let fetch_id = engine
            .stage_task(Task::new("fetch", serde_json::Value::Null))
            .unwrap();
        let outcome = engine
            .submit_task(Task::new("parse", serde_json::Value::Null).with_dependencies(vec![fetch_id]))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.errors.iter().any(|e| e.message == "timeout upstream"));
        assert_eq!(parser_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_json() {
        let engine = Orchestrator::new(config()).unwrap();
        engine
            .register_worker(ScriptedWorker::new("w1", "login", 5).arc())
            .await
            .unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::Created);
        assert_eq!(snapshot.workers.len(), 1);

        let json: serde_json::Value = serde_json::from_str(&engine.to_json().unwrap()).unwrap();
        assert_eq!(json["state"], "created");
        assert_eq!(json["workers"][0]["status"], "ready");
    }

    #[tokio::test]
    async fn test_events_published() {
        let engine = Orchestrator::new(config()).unwrap();
        let mut rx = engine.subscribe().unwrap();
        engine
            .register_worker(ScriptedWorker::new("w1", "login", 5).arc())
            .await
            .unwrap();
        engine.start().await.unwrap();
        let task = Task::new("login", serde_json::Value::Null);
        let task_id = task.id;
        engine.submit_task(task).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&EngineEvent::WorkerRegistered { worker_id: "w1".into() }));
        assert!(seen.contains(&EngineEvent::Started));
        assert!(seen.iter().any(|e| matches!(
            e,
            EngineEvent::TaskCompleted { task_id: id, .. } if *id == task_id
        )));
    }
}
