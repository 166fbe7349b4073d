use crate::arbiter::{ArbitrationPolicy, MAX_CORROBORATION_FACTOR};
use crate::catalog::{CatalogSettings, HostResources, MatchMode};
use crate::events::EventBusConfig;
use crate::patterns::{ExecutorSettings, RetryPolicy};
use quorum_core::{QuorumError, QuorumResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, usually the `[engine]` table of `quorum.toml`.
///
/// Every field has a default, so an empty table is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-attempt timeout when the task does not set one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Workers run side by side under the concurrent pattern.
    #[serde(default = "default_concurrent_fanout")]
    pub concurrent_fanout: usize,
    /// Tasks at or above this priority run concurrently when several workers match.
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: u8,
    /// Longest dependency chain a submitted task may pull in.
    #[serde(default = "default_max_dependency_depth")]
    pub max_dependency_depth: usize,
    /// How long deregistration waits for a worker's load to reach zero.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// How long `stop()` waits for orchestrations and attempts to settle.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// 0 disables periodic health checks.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Bound on a single health probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Weight of the newest observation in the success-rate EMA.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Finished outcomes kept in memory; the oldest is evicted first.
    #[serde(default = "default_outcome_cache_capacity")]
    pub outcome_cache_capacity: usize,
    /// Outcomes queued for the recorder before new ones are dropped.
    #[serde(default = "default_recorder_queue_capacity")]
    pub recorder_queue_capacity: usize,
    /// How competing results are arbitrated.
    #[serde(default)]
    pub arbitration: ArbitrationPolicy,
    /// How task types match capability names.
    #[serde(default)]
    pub matching: MatchMode,
    /// Event bus sizing.
    #[serde(default)]
    pub events: EventBusConfig,
    /// What the host can give any one worker.
    #[serde(default)]
    pub host: HostResources,
    /// Backoff between sequential retry passes.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Directory for worker registrations and the outcome log.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_concurrent_fanout() -> usize {
    3
}
fn default_priority_threshold() -> u8 {
    8
}
fn default_max_dependency_depth() -> usize {
    8
}
fn default_drain_timeout_ms() -> u64 {
    5_000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_ema_alpha() -> f64 {
    0.2
}
fn default_outcome_cache_capacity() -> usize {
    10_000
}
fn default_recorder_queue_capacity() -> usize {
    1_024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            concurrent_fanout: default_concurrent_fanout(),
            priority_threshold: default_priority_threshold(),
            max_dependency_depth: default_max_dependency_depth(),
            drain_timeout_ms: default_drain_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            ema_alpha: default_ema_alpha(),
            outcome_cache_capacity: default_outcome_cache_capacity(),
            recorder_queue_capacity: default_recorder_queue_capacity(),
            arbitration: ArbitrationPolicy::default(),
            matching: MatchMode::default(),
            events: EventBusConfig::default(),
            host: HostResources::default(),
            retry: RetryPolicy::default(),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> QuorumResult<Self> {
        let config: EngineConfig =
            toml::from_str(s).map_err(|e| QuorumError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> QuorumResult<()> {
        let fail = |msg: String| Err(QuorumError::Config(msg));
        if self.default_timeout_ms == 0 {
            return fail("default_timeout_ms must be greater than 0".into());
        }
        if self.concurrent_fanout == 0 {
            return fail("concurrent_fanout must be at least 1".into());
        }
        if self.priority_threshold > 10 {
            return fail(format!(
                "priority_threshold must be within 0..=10, got {}",
                self.priority_threshold
            ));
        }
        if self.max_dependency_depth == 0 {
            return fail("max_dependency_depth must be at least 1".into());
        }
        if self.probe_timeout_ms == 0 {
            return fail("probe_timeout_ms must be greater than 0".into());
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return fail(format!("ema_alpha must be within (0, 1], got {}", self.ema_alpha));
        }
        let arb = &self.arbitration;
        if !(1.0..=MAX_CORROBORATION_FACTOR).contains(&arb.corroboration_factor) {
            return fail(format!(
                "arbitration.corroboration_factor must be within 1.0..={MAX_CORROBORATION_FACTOR}, got {}",
                arb.corroboration_factor
            ));
        }
        if !(0.0..=1.0).contains(&arb.corroboration_cap) {
            return fail(format!(
                "arbitration.corroboration_cap must be within 0..=1, got {}",
                arb.corroboration_cap
            ));
        }
        if !(arb.tie_epsilon >= 0.0 && arb.tie_epsilon.is_finite()) {
            return fail("arbitration.tie_epsilon must be a finite, non-negative number".into());
        }
        if self.outcome_cache_capacity == 0 {
            return fail("outcome_cache_capacity must be at least 1".into());
        }
        if self.recorder_queue_capacity == 0 {
            return fail("recorder_queue_capacity must be at least 1".into());
        }
        if self.events.capacity == 0 {
            return fail("events.capacity must be at least 1".into());
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return fail("retry.backoff_base_ms must not exceed retry.backoff_max_ms".into());
        }
        Ok(())
    }

    /// [`default_timeout_ms`](Self::default_timeout_ms) as a `Duration`.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// [`drain_timeout_ms`](Self::drain_timeout_ms) as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// [`shutdown_timeout_ms`](Self::shutdown_timeout_ms) as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// `None` when periodic health checks are disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    /// The slice of this config the catalog needs.
    pub fn catalog_settings(&self) -> CatalogSettings {
        CatalogSettings {
            host: self.host.clone(),
            matching: self.matching,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    /// The slice of this config the pattern executor needs.
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            priority_threshold: self.priority_threshold,
            concurrent_fanout: self.concurrent_fanout,
            retry: self.retry.clone(),
        }
    }
}
