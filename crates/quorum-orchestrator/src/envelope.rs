use crate::cancel::CancelToken;
use crate::catalog::{CapabilityCatalog, Candidate};
use crate::types::{AttemptResult, Task, WorkerReport};
use chrono::Utc;
use quorum_core::{AttemptError, ErrorKind, QuorumError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Guards a single (task, worker) attempt.
///
/// Every call to [`run`](ExecutionEnvelope::run) yields exactly one
/// [`AttemptResult`]; nothing that goes wrong inside an attempt escapes as an
/// error.
pub struct ExecutionEnvelope {
    catalog: Arc<CapabilityCatalog>,
    default_timeout: Duration,
}

impl ExecutionEnvelope {
    /// Attempts time out after `default_timeout` unless the task says otherwise.
    pub fn new(catalog: Arc<CapabilityCatalog>, default_timeout: Duration) -> Self {
        Self {
            catalog,
            default_timeout,
        }
    }

    /// Time budget for one attempt: the task's own timeout or the engine
    /// default, shortened by the task deadline if that comes first.
    pub fn attempt_timeout(&self, task: &Task) -> Duration {
        let mut timeout = task
            .context
            .timeout_ms
            .map_or(self.default_timeout, Duration::from_millis);
        if let Some(deadline) = task.deadline {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            timeout = timeout.min(remaining);
        }
        timeout
    }

    /// Run one attempt of `task` on `candidate`.
    ///
    /// Holds a load slot for the attempt. Every failure, a timeout included,
    /// comes back as a failed result.
    pub async fn run(&self, task: &Task, candidate: &Candidate, cancel: &CancelToken) -> AttemptResult {
        let started = Instant::now();
        let worker_id = candidate.id().to_string();
        let capability = Some(candidate.capability.name.clone());
        let timeout = self.attempt_timeout(task);
        let fail = |error: AttemptError| {
            AttemptResult::failure(
                task.id,
                worker_id.clone(),
                capability.clone(),
                error,
                started.elapsed().as_millis() as u64,
            )
        };

        if cancel.is_cancelled() {
            return fail(AttemptError::from(QuorumError::Cancelled));
        }
        if timeout.is_zero() {
            return fail(AttemptError::from(QuorumError::Timeout(0)));
        }

        match tokio::time::timeout(timeout, candidate.worker.health_check()).await {
            Ok(report) if report.healthy => {}
            Ok(report) => {
                let issues = if report.issues.is_empty() {
                    "worker reported unhealthy".to_string()
                } else {
                    report.issues.join("; ")
                };
                debug!(task_id = %task.id, worker_id = %worker_id, issues = %issues, "Skipping unhealthy worker");
                return fail(AttemptError::from(QuorumError::Health(issues)));
            }
            Err(_) => {
                return fail(AttemptError::from(QuorumError::Health(format!(
                    "health probe timed out after {} ms",
                    timeout.as_millis()
                ))));
            }
        }

        let Some(slot) = self.catalog.begin_execution(&worker_id, task.id) else {
            return fail(AttemptError::new(
                ErrorKind::Resource,
                format!("worker '{worker_id}' has no free capacity"),
            ));
        };

        debug!(
            task_id = %task.id,
            worker_id = %worker_id,
            execution_id = %slot.execution_id(),
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching attempt"
        );

        // The call runs detached so a timed-out worker keeps its load slot
        // until it actually settles.
        let worker = candidate.worker.clone();
        let owned_task = task.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            worker.execute(&owned_task).await
        });

        let remaining = timeout.saturating_sub(started.elapsed());
        tokio::select! {
            joined = tokio::time::timeout(remaining, handle) => match joined {
                Err(_) => {
                    warn!(task_id = %task.id, worker_id = %worker_id, timeout_ms = timeout.as_millis() as u64, "Attempt timed out");
                    fail(AttemptError::from(QuorumError::Timeout(timeout.as_millis() as u64)))
                }
                Ok(Err(join_err)) => fail(AttemptError::new(
                    ErrorKind::WorkerExecution,
                    format!("worker call aborted: {join_err}"),
                )),
                Ok(Ok(Err(e))) => {
                    let message = match e {
                        QuorumError::WorkerExecution(msg) => msg,
                        other => other.to_string(),
                    };
                    fail(AttemptError::new(ErrorKind::WorkerExecution, message))
                }
                Ok(Ok(Ok(report))) => {
                    self.result_from_report(task, worker_id.clone(), capability.clone(), report, started)
                }
            },
            () = cancel.cancelled() => {
                debug!(task_id = %task.id, worker_id = %worker_id, "Attempt abandoned after cancellation");
                fail(AttemptError::from(QuorumError::Cancelled))
            }
        }
    }

    fn result_from_report(
        &self,
        task: &Task,
        worker_id: String,
        capability: Option<String>,
        report: WorkerReport,
        started: Instant,
    ) -> AttemptResult {
        let confidence = if report.confidence.is_finite() {
            report.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut errors: Vec<AttemptError> = report
            .errors
            .into_iter()
            .map(|msg| AttemptError::new(ErrorKind::WorkerExecution, msg))
            .collect();
        if !report.success && errors.is_empty() {
            errors.push(AttemptError::new(
                ErrorKind::WorkerExecution,
                "worker reported failure",
            ));
        }
        if report.success {
            errors.clear();
        }

        AttemptResult {
            task_id: task.id,
            worker_id,
            capability,
            success: report.success,
            payload: report.payload,
            confidence,
            elapsed_ms: started.elapsed().as_millis() as u64,
            resource_usage: report.resource_usage,
            errors,
            completed_at: Utc::now(),
        }
    }
}
