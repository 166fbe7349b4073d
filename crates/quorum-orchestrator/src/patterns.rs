use crate::arbiter::{Arbitration, ResultArbiter};
use crate::cancel::CancelToken;
use crate::catalog::{Candidate, CapabilityCatalog};
use crate::envelope::ExecutionEnvelope;
use crate::types::{AttemptResult, OrchestrationPattern, Outcome, ResourceUsage, Task};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use quorum_core::{AttemptError, QuorumError, QuorumResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backoff between sequential retry passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry pass `attempt` (0-based), capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Choose a pattern for a task that did not name one.
pub fn select_pattern(task: &Task, candidate_count: usize, priority_threshold: u8) -> OrchestrationPattern {
    if let Some(pattern) = task.context.orchestration_pattern {
        return pattern;
    }
    if task.priority >= priority_threshold && candidate_count > 1 {
        return OrchestrationPattern::Concurrent;
    }
    if !task.dependencies.is_empty() {
        return OrchestrationPattern::Hierarchical;
    }
    let tag = task.task_type.to_lowercase();
    if tag.contains("pipeline") || tag.contains("multi-step") {
        OrchestrationPattern::Pipeline
    } else if tag.contains("monitor") || tag.contains("reactive") {
        OrchestrationPattern::SingleShot
    } else {
        OrchestrationPattern::Sequential
    }
}

/// Combines the successful payloads of a scatter-gather run into one.
///
/// `successes` arrive best first.
pub trait Aggregator: Send + Sync {
    /// Merge the successful results into one payload.
    fn aggregate(&self, task: &Task, successes: &[AttemptResult]) -> QuorumResult<serde_json::Value>;
}

/// Lists every successful payload with its origin.
pub struct CollectAggregator;

impl Aggregator for CollectAggregator {
    fn aggregate(&self, _task: &Task, successes: &[AttemptResult]) -> QuorumResult<serde_json::Value> {
        let results: Vec<serde_json::Value> = successes
            .iter()
            .map(|r| {
                serde_json::json!({
                    "worker_id": r.worker_id,
                    "confidence": r.confidence,
                    "payload": r.payload,
                })
            })
            .collect();
        Ok(serde_json::json!({ "count": results.len(), "results": results }))
    }
}

/// Shallow-merges object payloads; on key conflicts the better result wins.
pub struct MergeObjectsAggregator;

impl Aggregator for MergeObjectsAggregator {
    fn aggregate(&self, _task: &Task, successes: &[AttemptResult]) -> QuorumResult<serde_json::Value> {
        let mut merged = serde_json::Map::new();
        for result in successes {
            let serde_json::Value::Object(fields) = &result.payload else {
                return Err(QuorumError::Validation(format!(
                    "merge aggregator needs object payloads, '{}' returned {}",
                    result.worker_id, result.payload
                )));
            };
            for (key, value) in fields {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(serde_json::Value::Object(merged))
    }
}

/// Fold the winning payloads of a task's dependencies into its payload.
pub fn fold_dependencies(task: &Task, resolved: &[(Uuid, Outcome)]) -> Task {
    let mut dependencies = serde_json::Map::new();
    for (id, outcome) in resolved {
        let payload = outcome
            .winner
            .as_ref()
            .map_or(serde_json::Value::Null, |w| w.payload.clone());
        dependencies.insert(id.to_string(), payload);
    }
    let mut folded = task.clone();
    folded.payload = serde_json::json!({
        "input": task.payload,
        "dependencies": dependencies,
    });
    folded
}

/// Executor tuning taken from the engine config.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Unpatterned tasks at or above this priority fan out when several workers match.
    pub priority_threshold: u8,
    /// Default fan-out for the concurrent pattern.
    pub concurrent_fanout: usize,
    /// Backoff between sequential retry passes.
    pub retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            priority_threshold: 8,
            concurrent_fanout: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Runs a task against its candidates under one orchestration pattern.
pub struct PatternExecutor {
    envelope: ExecutionEnvelope,
    arbiter: ResultArbiter,
    catalog: Arc<CapabilityCatalog>,
    settings: ExecutorSettings,
    aggregators: RwLock<HashMap<String, Arc<dyn Aggregator>>>,
    halt: CancelToken,
}

impl PatternExecutor {
    /// An executor with the built-in `collect` and `merge` aggregators.
    pub fn new(
        envelope: ExecutionEnvelope,
        arbiter: ResultArbiter,
        catalog: Arc<CapabilityCatalog>,
        settings: ExecutorSettings,
    ) -> Self {
        let executor = Self {
            envelope,
            arbiter,
            catalog,
            settings,
            aggregators: RwLock::new(HashMap::new()),
            halt: CancelToken::new(),
        };
        executor.register_aggregator("collect", Arc::new(CollectAggregator));
        executor.register_aggregator("merge", Arc::new(MergeObjectsAggregator));
        executor
    }

    /// Stop dispatching new attempts once `halt` is cancelled.
    ///
    /// Unlike a per-task token, `halt` never abandons an attempt that is
    /// already running; its result is still arbitrated.
    pub fn with_halt(mut self, halt: CancelToken) -> Self {
        self.halt = halt;
        self
    }

    /// Tuning this executor was built with.
    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// The arbiter applied to every pattern's results.
    pub fn arbiter(&self) -> &ResultArbiter {
        &self.arbiter
    }

    /// Register (or replace) a named scatter-gather aggregator.
    pub fn register_aggregator(&self, name: impl Into<String>, aggregator: Arc<dyn Aggregator>) {
        self.aggregators.write().insert(name.into(), aggregator);
    }

    /// Whether an aggregator is registered under `name`.
    pub fn has_aggregator(&self, name: &str) -> bool {
        self.aggregators.read().contains_key(name)
    }

    /// Run `task` under `pattern` and arbitrate the attempts into an outcome.
    ///
    /// `candidates` must be ranked best first.
    pub async fn execute(
        &self,
        task: &Task,
        pattern: OrchestrationPattern,
        candidates: &[Candidate],
        cancel: &CancelToken,
    ) -> QuorumResult<Outcome> {
        if candidates.is_empty() {
            return Err(QuorumError::NoCapableWorker(task.task_type.clone()));
        }
        let started = Instant::now();
        let priorities = priority_map(candidates);

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            pattern = %pattern,
            candidates = candidates.len(),
            "Executing task"
        );

        let (arbitration, attempts) = match pattern {
            OrchestrationPattern::Sequential | OrchestrationPattern::Hierarchical => {
                let attempts = self.run_sequential(task, candidates, cancel).await;
                (self.arbiter.select(&attempts, &priorities), attempts)
            }
            OrchestrationPattern::SingleShot => {
                let attempts = self.run_sequential_pass(task, &candidates[..1], cancel).await;
                (self.arbiter.select(&attempts, &priorities), attempts)
            }
            OrchestrationPattern::Concurrent => {
                let fanout = task
                    .context
                    .max_fanout
                    .unwrap_or(self.settings.concurrent_fanout)
                    .max(1);
                let selected = &candidates[..fanout.min(candidates.len())];
                let attempts = self.run_parallel(task, selected, cancel).await;
                (self.arbiter.select(&attempts, &priorities), attempts)
            }
            OrchestrationPattern::ScatterGather => {
                self.run_scatter_gather(task, candidates, &priorities, cancel).await?
            }
            OrchestrationPattern::Pipeline => self.run_pipeline(task, candidates, cancel).await?,
        };

        let mut outcome = arbitration.into_outcome(
            task.id,
            Some(pattern),
            &attempts,
            started.elapsed().as_millis() as u64,
        );
        if attempts.is_empty() && self.stopped(cancel) {
            outcome.errors.push(AttemptError::from(QuorumError::Cancelled));
            outcome.rationale = "cancelled before any attempt was dispatched".to_string();
        }
        Ok(outcome)
    }

    /// No new attempts once the task is cancelled or the executor halted.
    fn stopped(&self, cancel: &CancelToken) -> bool {
        cancel.is_cancelled() || self.halt.is_cancelled()
    }

    /// Ranked candidates one at a time until one succeeds, with retry passes.
    async fn run_sequential(
        &self,
        task: &Task,
        candidates: &[Candidate],
        cancel: &CancelToken,
    ) -> Vec<AttemptResult> {
        let mut attempts = Vec::new();
        let mut pass_task = task.clone();
        loop {
            let pass = self.run_sequential_pass(&pass_task, candidates, cancel).await;
            let succeeded = pass.iter().any(|r| r.success);
            if let Some(last) = pass.last() {
                pass_task.context.previous_result = Some(Box::new(last.clone()));
            }
            attempts.extend(pass);

            if succeeded
                || self.stopped(cancel)
                || pass_task.context.retry_count >= pass_task.context.max_retries
            {
                return attempts;
            }

            let delay = self.settings.retry.backoff(pass_task.context.retry_count);
            debug!(
                task_id = %task.id,
                retry = pass_task.context.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                "All candidates failed, backing off before retry pass"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return attempts,
                () = self.halt.cancelled() => return attempts,
            }
            pass_task.context.retry_count += 1;
        }
    }

    async fn run_sequential_pass(
        &self,
        task: &Task,
        candidates: &[Candidate],
        cancel: &CancelToken,
    ) -> Vec<AttemptResult> {
        let mut attempts = Vec::new();
        let mut attempt_task = task.clone();
        for candidate in candidates {
            if self.stopped(cancel) {
                break;
            }
            let result = self.envelope.run(&attempt_task, candidate, cancel).await;
            let succeeded = result.success;
            if !succeeded {
                debug!(
                    task_id = %task.id,
                    worker_id = %result.worker_id,
                    error = ?result.error_kind(),
                    "Attempt failed, moving to next candidate"
                );
                attempt_task.context.previous_result = Some(Box::new(result.clone()));
            }
            attempts.push(result);
            if succeeded {
                break;
            }
        }
        attempts
    }

    async fn run_parallel(
        &self,
        task: &Task,
        candidates: &[Candidate],
        cancel: &CancelToken,
    ) -> Vec<AttemptResult> {
        if self.stopped(cancel) {
            return Vec::new();
        }
        join_all(
            candidates
                .iter()
                .map(|candidate| self.envelope.run(task, candidate, cancel)),
        )
        .await
    }

    async fn run_scatter_gather(
        &self,
        task: &Task,
        candidates: &[Candidate],
        priorities: &HashMap<String, u32>,
        cancel: &CancelToken,
    ) -> QuorumResult<(Arbitration, Vec<AttemptResult>)> {
        let aggregation = match task.context.aggregation.as_deref() {
            Some(name) => {
                let aggregator = self.aggregators.read().get(name).cloned().ok_or_else(|| {
                    QuorumError::Validation(format!("unknown aggregation strategy '{name}'"))
                })?;
                Some((name.to_string(), aggregator))
            }
            None => None,
        };

        let attempts = self.run_parallel(task, candidates, cancel).await;
        let Some((name, aggregator)) = aggregation else {
            return Ok((self.arbiter.select(&attempts, priorities), attempts));
        };

        let mut arbitration = self.arbiter.fuse(&attempts, priorities);
        let Some(best) = arbitration.winner.clone() else {
            return Ok((arbitration, attempts));
        };

        let mut successes: Vec<AttemptResult> =
            attempts.iter().filter(|r| r.success).cloned().collect();
        successes.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| {
                    let pa = priorities.get(&a.worker_id).copied().unwrap_or(0);
                    let pb = priorities.get(&b.worker_id).copied().unwrap_or(0);
                    pb.cmp(&pa)
                })
                .then_with(|| a.elapsed_ms.cmp(&b.elapsed_ms))
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });

        match aggregator.aggregate(task, &successes) {
            Ok(payload) => {
                let usage = successes
                    .iter()
                    .fold(ResourceUsage::default(), |acc, r| acc.combine(r.resource_usage));
                let synthesized = AttemptResult {
                    task_id: task.id,
                    worker_id: format!("aggregate:{name}"),
                    capability: best.capability.clone(),
                    success: true,
                    payload,
                    confidence: arbitration.confidence,
                    elapsed_ms: arbitration.elapsed_ms,
                    resource_usage: usage,
                    errors: Vec::new(),
                    completed_at: Utc::now(),
                };
                let max_alternatives = self.arbiter.policy().max_alternatives;
                arbitration.alternatives = successes.into_iter().take(max_alternatives).collect();
                arbitration.winner = Some(synthesized);
                arbitration.rationale = format!(
                    "aggregated {} success(es) with '{name}'; {}",
                    arbitration.successes, arbitration.rationale
                );
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    aggregation = %name,
                    error = %e,
                    "Aggregation failed, falling back to single winner"
                );
                arbitration = self.arbiter.select(&attempts, priorities);
                arbitration.rationale =
                    format!("aggregation '{name}' failed ({e}); {}", arbitration.rationale);
            }
        }
        Ok((arbitration, attempts))
    }

    /// Resolve the stage list: explicit tags looked up in the catalog, or
    /// the candidates partitioned by capability category in rank order.
    fn pipeline_stages(&self, task: &Task, candidates: &[Candidate]) -> QuorumResult<Vec<(String, Vec<Candidate>)>> {
        if !task.context.pipeline_stages.is_empty() {
            return task
                .context
                .pipeline_stages
                .iter()
                .map(|tag| Ok((tag.clone(), self.catalog.find_candidates(tag)?)))
                .collect();
        }
        let mut stages: Vec<(String, Vec<Candidate>)> = Vec::new();
        for candidate in candidates {
            let category = candidate.category().to_string();
            match stages.iter_mut().find(|(name, _)| *name == category) {
                Some((_, members)) => members.push(candidate.clone()),
                None => stages.push((category, vec![candidate.clone()])),
            }
        }
        Ok(stages)
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        candidates: &[Candidate],
        cancel: &CancelToken,
    ) -> QuorumResult<(Arbitration, Vec<AttemptResult>)> {
        let stages = self.pipeline_stages(task, candidates)?;
        let mut attempts = Vec::new();
        let mut payload = task.payload.clone();
        let mut last: Option<Arbitration> = None;

        for (index, (stage, members)) in stages.iter().enumerate() {
            let mut stage_task = task.clone();
            stage_task.payload = payload.clone();
            stage_task.context.pipeline_stage = Some(index);

            let stage_attempts = self.run_sequential(&stage_task, members, cancel).await;
            let mut arbitration = self.arbiter.select(&stage_attempts, &priority_map(members));
            attempts.extend(stage_attempts);

            match &arbitration.winner {
                Some(winner) => {
                    debug!(task_id = %task.id, stage = %stage, worker_id = %winner.worker_id, "Pipeline stage complete");
                    payload = winner.payload.clone();
                }
                None => {
                    arbitration.rationale = format!(
                        "pipeline aborted at stage {} ('{stage}'): {}",
                        index + 1,
                        arbitration.rationale
                    );
                    arbitration.elapsed_ms = attempts.iter().map(|r| r.elapsed_ms).max().unwrap_or(0);
                    return Ok((arbitration, attempts));
                }
            }
            last = Some(arbitration);
        }

        let mut arbitration = last.unwrap_or_else(|| self.arbiter.select(&[], &HashMap::new()));
        arbitration.elapsed_ms = attempts.iter().map(|r| r.elapsed_ms).max().unwrap_or(0);
        if arbitration.winner.is_some() {
            arbitration.rationale = format!(
                "pipeline completed {} stage(s); final stage {}",
                stages.len(),
                arbitration.rationale
            );
        }
        Ok((arbitration, attempts))
    }
}

fn priority_map(candidates: &[Candidate]) -> HashMap<String, u32> {
    candidates
        .iter()
        .map(|c| (c.id().to_string(), c.priority()))
        .collect()
}
