//! Simulated workers declared under `[[workers]]` in `quorum.toml`.

use async_trait::async_trait;
use quorum_core::{QuorumError, QuorumResult};
use quorum_orchestrator::{
    Capability, HealthReport, ResourceUsage, Task, Worker, WorkerDescriptor, WorkerFactory,
    WorkerReport,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SIMULATED_KIND: &str = "simulated";

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedWorkerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub latency_ms: u64,
    /// Every n-th call fails; 0 never fails.
    #[serde(default)]
    pub fail_every: u64,
    #[serde(default)]
    pub unhealthy: bool,
}

fn default_priority() -> u32 {
    5
}
fn default_max_concurrent() -> usize {
    1
}
fn default_confidence() -> f64 {
    0.8
}

impl SimulatedWorkerConfig {
    pub fn descriptor(&self) -> WorkerDescriptor {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let mut descriptor = WorkerDescriptor::new(&self.id, name, SIMULATED_KIND)
            .with_priority(self.priority)
            .with_max_concurrent(self.max_concurrent);
        for tag in &self.capabilities {
            let mut capability = Capability::new(tag, self.confidence);
            if let Some(category) = &self.category {
                capability = capability.with_category(category);
            }
            descriptor = descriptor.with_capability(capability);
        }
        descriptor
    }
}

#[derive(Debug, Clone)]
struct Behavior {
    confidence: f64,
    latency: Duration,
    fail_every: u64,
    unhealthy: bool,
}

impl From<&SimulatedWorkerConfig> for Behavior {
    fn from(config: &SimulatedWorkerConfig) -> Self {
        Self {
            confidence: config.confidence,
            latency: Duration::from_millis(config.latency_ms),
            fail_every: config.fail_every,
            unhealthy: config.unhealthy,
        }
    }
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
            latency: Duration::ZERO,
            fail_every: 0,
            unhealthy: false,
        }
    }
}

/// A worker that echoes its input after a fixed latency.
pub struct SimulatedWorker {
    descriptor: WorkerDescriptor,
    behavior: Behavior,
    calls: AtomicU64,
}

impl SimulatedWorker {
    pub fn from_config(config: &SimulatedWorkerConfig) -> Self {
        Self {
            descriptor: config.descriptor(),
            behavior: Behavior::from(config),
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Worker for SimulatedWorker {
    fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    async fn health_check(&self) -> HealthReport {
        if self.behavior.unhealthy {
            HealthReport::unhealthy(vec!["configured as unhealthy".into()])
        } else {
            HealthReport::healthy()
        }
    }

    async fn execute(&self, task: &Task) -> QuorumResult<WorkerReport> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.behavior.latency).await;
        if self.behavior.fail_every > 0 && call % self.behavior.fail_every == 0 {
            return Err(QuorumError::WorkerExecution(format!(
                "simulated failure on call {call}"
            )));
        }
        let usage = ResourceUsage {
            cpu_ms: self.behavior.latency.as_millis() as u64,
            memory_mb: self.descriptor.resources.memory_mb,
            network_bytes: task.payload.to_string().len() as u64,
        };
        Ok(WorkerReport::success(
            serde_json::json!({
                "worker": self.descriptor.id,
                "task_type": task.task_type,
                "echo": task.payload,
            }),
            self.behavior.confidence,
        )
        .with_usage(usage))
    }
}

/// Rebuilds persisted simulated workers, using the config entry when one
/// still exists for the id.
pub struct SimulatedFactory {
    behaviors: HashMap<String, Behavior>,
}

impl SimulatedFactory {
    pub fn new(configs: &[SimulatedWorkerConfig]) -> Self {
        Self {
            behaviors: configs
                .iter()
                .map(|c| (c.id.clone(), Behavior::from(c)))
                .collect(),
        }
    }
}

impl WorkerFactory for SimulatedFactory {
    fn build(&self, descriptor: &WorkerDescriptor) -> Option<Arc<dyn Worker>> {
        if descriptor.kind != SIMULATED_KIND {
            return None;
        }
        let behavior = self
            .behaviors
            .get(&descriptor.id)
            .cloned()
            .unwrap_or_default();
        Some(Arc::new(SimulatedWorker {
            descriptor: descriptor.clone(),
            behavior,
            calls: AtomicU64::new(0),
        }))
    }
}
