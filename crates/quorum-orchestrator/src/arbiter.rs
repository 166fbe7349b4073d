use crate::types::{AttemptResult, AttemptSummary, OrchestrationPattern, Outcome};
use chrono::Utc;
use quorum_core::AttemptError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// Upper bound on the corroboration multiplier.
pub const MAX_CORROBORATION_FACTOR: f64 = 1.1;

/// Tunables for result arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationPolicy {
    /// Confidences closer than this are treated as tied.
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f64,
    /// Runner-up results kept on the outcome.
    #[serde(default = "default_max_alternatives")]
    pub max_alternatives: usize,
    /// Multiplier applied when independent successes corroborate each other.
    #[serde(default = "default_corroboration_factor")]
    pub corroboration_factor: f64,
    /// Boosting never lifts confidence above this value.
    #[serde(default = "default_corroboration_cap")]
    pub corroboration_cap: f64,
}

fn default_tie_epsilon() -> f64 {
    1e-6
}
fn default_max_alternatives() -> usize {
    3
}
fn default_corroboration_factor() -> f64 {
    MAX_CORROBORATION_FACTOR
}
fn default_corroboration_cap() -> f64 {
    0.95
}

impl Default for ArbitrationPolicy {
    fn default() -> Self {
        Self {
            tie_epsilon: default_tie_epsilon(),
            max_alternatives: default_max_alternatives(),
            corroboration_factor: default_corroboration_factor(),
            corroboration_cap: default_corroboration_cap(),
        }
    }
}

/// The arbiter's verdict over a set of results for one decision.
#[derive(Debug, Clone)]
pub struct Arbitration {
    /// Chosen result, if any attempt succeeded.
    pub winner: Option<AttemptResult>,
    /// Winner confidence after corroboration.
    pub confidence: f64,
    /// Runner-up successes, best first.
    pub alternatives: Vec<AttemptResult>,
    /// Errors from every failed attempt.
    pub errors: Vec<AttemptError>,
    /// Largest elapsed time among the results.
    pub elapsed_ms: u64,
    /// Number of successful results.
    pub successes: usize,
    /// Why this winner was chosen.
    pub rationale: String,
}

impl Arbitration {
    /// Whether a winner was chosen.
    pub fn success(&self) -> bool {
        self.winner.is_some()
    }

    /// Attach task identity and bookkeeping to produce the final outcome.
    pub fn into_outcome(
        self,
        task_id: Uuid,
        pattern: Option<OrchestrationPattern>,
        attempts: &[AttemptResult],
        wall_time_ms: u64,
    ) -> Outcome {
        Outcome {
            task_id,
            success: self.winner.is_some(),
            winner: self.winner,
            confidence: self.confidence,
            alternatives: self.alternatives,
            errors: self.errors,
            elapsed_ms: self.elapsed_ms,
            wall_time_ms,
            attempts: attempts.iter().map(AttemptSummary::from).collect(),
            pattern,
            rationale: self.rationale,
            completed_at: Utc::now(),
        }
    }
}

/// Picks the best of several results answering the same question.
///
/// The verdict depends only on the set of results passed in, never on the
/// order they arrived in.
#[derive(Debug, Clone, Default)]
pub struct ResultArbiter {
    policy: ArbitrationPolicy,
}

impl ResultArbiter {
    /// Clamps the corroboration factor into its allowed range.
    pub fn new(mut policy: ArbitrationPolicy) -> Self {
        policy.corroboration_factor = policy
            .corroboration_factor
            .clamp(1.0, MAX_CORROBORATION_FACTOR);
        Self { policy }
    }

    /// The policy in effect, after clamping.
    pub fn policy(&self) -> &ArbitrationPolicy {
        &self.policy
    }

    /// Single-winner selection: the reported confidence is the winner's own.
    pub fn select(
        &self,
        results: &[AttemptResult],
        priorities: &HashMap<String, u32>,
    ) -> Arbitration {
        self.arbitrate(results, priorities, false)
    }

    /// Selection over independently produced answers: two or more successes
    /// corroborate each other and boost the reported confidence.
    pub fn fuse(
        &self,
        results: &[AttemptResult],
        priorities: &HashMap<String, u32>,
    ) -> Arbitration {
        self.arbitrate(results, priorities, true)
    }

    /// `max(best, min(best × factor, cap))` when at least two successes agree.
    pub fn boosted_confidence(&self, best: f64, successes: usize) -> f64 {
        if successes < 2 {
            return best;
        }
        let boosted = (best * self.policy.corroboration_factor).min(self.policy.corroboration_cap);
        best.max(boosted)
    }

    fn arbitrate(
        &self,
        results: &[AttemptResult],
        priorities: &HashMap<String, u32>,
        corroborate: bool,
    ) -> Arbitration {
        let elapsed_ms = results.iter().map(|r| r.elapsed_ms).max().unwrap_or(0);
        let priority = |r: &AttemptResult| priorities.get(&r.worker_id).copied().unwrap_or(0);

        let mut successes: Vec<&AttemptResult> = results.iter().filter(|r| r.success).collect();
        if successes.is_empty() {
            let mut failures: Vec<&AttemptResult> = results.iter().collect();
            failures.sort_by(|a, b| {
                a.worker_id
                    .cmp(&b.worker_id)
                    .then_with(|| a.elapsed_ms.cmp(&b.elapsed_ms))
            });
            let errors: Vec<AttemptError> =
                failures.iter().flat_map(|r| r.errors.iter().cloned()).collect();
            let rationale = if results.is_empty() {
                "no attempts were made".to_string()
            } else {
                format!(
                    "all {} attempt(s) failed with {} error(s)",
                    results.len(),
                    errors.len()
                )
            };
            return Arbitration {
                winner: None,
                confidence: 0.0,
                alternatives: Vec::new(),
                errors,
                elapsed_ms,
                successes: 0,
                rationale,
            };
        }

        // Total order: confidence desc, priority desc, elapsed asc, id asc.
        let by_rank = |a: &&AttemptResult, b: &&AttemptResult| -> Ordering {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| priority(b).cmp(&priority(a)))
                .then_with(|| a.elapsed_ms.cmp(&b.elapsed_ms))
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        };
        successes.sort_by(by_rank);

        let best_confidence = successes[0].confidence;
        let tie_floor = best_confidence - self.policy.tie_epsilon;
        let tied = successes
            .iter()
            .take_while(|r| r.confidence >= tie_floor)
            .count();
        let winner_index = successes[..tied]
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                priority(b)
                    .cmp(&priority(a))
                    .then_with(|| a.elapsed_ms.cmp(&b.elapsed_ms))
                    .then_with(|| a.worker_id.cmp(&b.worker_id))
            })
            .map_or(0, |(i, _)| i);
        let winner = successes.remove(winner_index);

        let success_count = successes.len() + 1;
        let confidence = if corroborate {
            self.boosted_confidence(winner.confidence, success_count)
        } else {
            winner.confidence
        };

        let mut rationale = format!(
            "selected '{}' with confidence {:.3} from {} success(es) out of {} attempt(s)",
            winner.worker_id,
            winner.confidence,
            success_count,
            results.len()
        );
        if tied > 1 {
            rationale.push_str(&format!(
                "; {tied} results tied within {:e}, broken by priority then elapsed time",
                self.policy.tie_epsilon
            ));
        }
        if corroborate && confidence > winner.confidence {
            rationale.push_str(&format!(
                "; corroborated by {} other success(es), confidence raised to {confidence:.3}",
                success_count - 1
            ));
        }

        Arbitration {
            winner: Some(winner.clone()),
            confidence,
            alternatives: successes
                .into_iter()
                .take(self.policy.max_alternatives)
                .cloned()
                .collect(),
            errors: Vec::new(),
            elapsed_ms,
            successes: success_count,
            rationale,
        }
    }
}
