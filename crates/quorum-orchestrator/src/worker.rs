use crate::types::{HealthReport, Task, WorkerDescriptor, WorkerReport};
use async_trait::async_trait;
use quorum_core::QuorumResult;
use std::sync::Arc;

/// Contract every worker satisfies. The engine never looks inside.
///
/// Both methods may suspend for as long as they like; the engine bounds them
/// with timeouts but never assumes it can cancel a call in progress.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identity, capabilities and resource needs.
    fn descriptor(&self) -> &WorkerDescriptor;

    /// Report whether the worker can take work.
    async fn health_check(&self) -> HealthReport;

    /// Run the task. An `Err` is recorded as a worker execution failure with
    /// its message preserved.
    async fn execute(&self, task: &Task) -> QuorumResult<WorkerReport>;
}

/// Rebuilds live workers from persisted registrations at start-up.
pub trait WorkerFactory: Send + Sync {
    /// Returns `None` when the descriptor's kind is not known to this factory.
    fn build(&self, descriptor: &WorkerDescriptor) -> Option<Arc<dyn Worker>>;
}
