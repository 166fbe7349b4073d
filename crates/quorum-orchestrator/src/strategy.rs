use crate::arbiter::ResultArbiter;
use crate::recorder::OutcomeRecorder;
use crate::types::{AttemptResult, OrchestrationPattern, Outcome, ResourceUsage};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use quorum_core::{AttemptError, QuorumError, QuorumResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// A question several strategies compete to answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Fresh per problem.
    pub id: Uuid,
    /// Problem family; part of the signature.
    pub kind: String,
    /// Input handed to every strategy.
    pub payload: serde_json::Value,
}

impl Problem {
    /// A problem with a fresh id.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
        }
    }

    /// Stable key for remembering which strategy solved this kind of problem.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.to_lowercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One strategy's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAnswer {
    /// The answer itself.
    pub payload: serde_json::Value,
    /// Strategy confidence in [0, 1].
    pub confidence: f64,
}

/// One independent way of solving a [`Problem`].
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Stable name; doubles as the worker id in outcomes.
    fn name(&self) -> &str;
    /// Attempt the problem.
    async fn solve(&self, problem: &Problem) -> QuorumResult<StrategyAnswer>;
}

/// Runs every strategy on the same problem and arbitrates their answers.
pub struct StrategyArbiter {
    strategies: Vec<Arc<dyn Strategy>>,
    arbiter: ResultArbiter,
    recorder: Arc<OutcomeRecorder>,
    timeout: Duration,
}

impl StrategyArbiter {
    /// Strategies that outlive `timeout` count as timed out.
    pub fn new(arbiter: ResultArbiter, recorder: Arc<OutcomeRecorder>, timeout: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            arbiter,
            recorder,
            timeout,
        }
    }

    /// Add a competing strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Names of the registered strategies, in order.
    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run every strategy concurrently and arbitrate the answers.
    ///
    /// Fails with a validation error when no strategies are registered.
    pub async fn solve(&self, problem: &Problem) -> QuorumResult<Outcome> {
        if self.strategies.is_empty() {
            return Err(QuorumError::Validation(
                "no strategies registered for arbitration".into(),
            ));
        }
        let started = Instant::now();
        let signature = problem.signature();
        let prior = self.recorder.strategy_prior(&signature);

        // The previous winner breaks confidence ties.
        let priorities: HashMap<String, u32> = self
            .strategies
            .iter()
            .map(|s| {
                let boost = u32::from(prior.as_deref() == Some(s.name()));
                (s.name().to_string(), boost)
            })
            .collect();

        let results = join_all(self.strategies.iter().map(|s| self.attempt(s.as_ref(), problem))).await;
        let arbitration = self.arbiter.fuse(&results, &priorities);

        if let Some(winner) = &arbitration.winner {
            self.recorder.record_strategy_win(&signature, &winner.worker_id);
            info!(
                problem_kind = %problem.kind,
                strategy = %winner.worker_id,
                confidence = arbitration.confidence,
                prior = ?prior,
                "Strategy arbitration complete"
            );
        } else {
            info!(problem_kind = %problem.kind, strategies = results.len(), "Every strategy failed");
        }

        Ok(arbitration.into_outcome(
            problem.id,
            Some(OrchestrationPattern::ScatterGather),
            &results,
            started.elapsed().as_millis() as u64,
        ))
    }

    async fn attempt(&self, strategy: &dyn Strategy, problem: &Problem) -> AttemptResult {
        let started = Instant::now();
        let name = strategy.name().to_string();
        let outcome = tokio::time::timeout(self.timeout, strategy.solve(problem)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(answer)) => {
                debug!(strategy = %name, confidence = answer.confidence, "Strategy answered");
                AttemptResult {
                    task_id: problem.id,
                    worker_id: name,
                    capability: Some(problem.kind.clone()),
                    success: true,
                    payload: answer.payload,
                    confidence: if answer.confidence.is_finite() {
                        answer.confidence.clamp(0.0, 1.0)
                    } else {
                        0.0
                    },
                    elapsed_ms,
                    resource_usage: ResourceUsage::default(),
                    errors: Vec::new(),
                    completed_at: Utc::now(),
                }
            }
            Ok(Err(e)) => AttemptResult::failure(
                problem.id,
                name,
                Some(problem.kind.clone()),
                AttemptError::from(e),
                elapsed_ms,
            ),
            Err(_) => AttemptResult::failure(
                problem.id,
                name,
                Some(problem.kind.clone()),
                AttemptError::from(QuorumError::Timeout(self.timeout.as_millis() as u64)),
                elapsed_ms,
            ),
        }
    }
}
