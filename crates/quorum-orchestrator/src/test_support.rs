//! Scripted workers shared by the unit tests.

use crate::types::{
    Capability, HealthReport, Task, WorkerDescriptor, WorkerReport,
};
use crate::worker::Worker;
use async_trait::async_trait;
use quorum_core::{QuorumError, QuorumResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) enum Behavior {
    Succeed(f64),
    Report(String),
    Error(String),
}

pub(crate) struct ScriptedWorker {
    descriptor: WorkerDescriptor,
    healthy: Arc<AtomicBool>,
    behavior: Behavior,
    delay: Duration,
    health_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedWorker {
    pub(crate) fn new(id: &str, capability: &str, priority: u32) -> Self {
        Self::from_descriptor(
            WorkerDescriptor::new(id, id.to_uppercase(), "scripted")
                .with_capability(Capability::new(capability, 0.8))
                .with_priority(priority),
        )
    }

    pub(crate) fn from_descriptor(descriptor: WorkerDescriptor) -> Self {
        Self {
            descriptor,
            healthy: Arc::new(AtomicBool::new(true)),
            behavior: Behavior::Succeed(0.8),
            delay: Duration::ZERO,
            health_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_max_concurrent(mut self, max: usize) -> Self {
        self.descriptor.resources.max_concurrent_tasks = max;
        self
    }

    /// Health probes take this long to answer.
    pub(crate) fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    pub(crate) fn with_confidence(mut self, confidence: f64) -> Self {
        self.behavior = Behavior::Succeed(confidence);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reports `success: false` with the given message.
    pub(crate) fn failing(mut self, message: &str) -> Self {
        self.behavior = Behavior::Report(message.to_string());
        self
    }

    /// Returns `Err` from `execute`.
    pub(crate) fn erroring(mut self, message: &str) -> Self {
        self.behavior = Behavior::Error(message.to_string());
        self
    }

    pub(crate) fn unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn health_switch(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }

    pub(crate) fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub(crate) fn arc(self) -> Arc<dyn Worker> {
        Arc::new(self)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    async fn health_check(&self) -> HealthReport {
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            HealthReport::healthy()
        } else {
            HealthReport::unhealthy(vec!["scripted outage".into()])
        }
    }

    async fn execute(&self, task: &Task) -> QuorumResult<WorkerReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            Behavior::Succeed(confidence) => Ok(WorkerReport::success(
                serde_json::json!({ "worker": self.descriptor.id, "input": task.payload }),
                *confidence,
            )),
            Behavior::Report(message) => Ok(WorkerReport::failure(message.clone())),
            Behavior::Error(message) => Err(QuorumError::WorkerExecution(message.clone())),
        }
    }
}
