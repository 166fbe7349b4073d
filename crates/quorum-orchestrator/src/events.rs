use crate::types::{OrchestrationPattern, WorkerStatus};
use quorum_core::{QuorumError, QuorumResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// A lifecycle event published to telemetry subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The engine entered the running state.
    Started,
    /// The engine finished shutting down.
    Stopped,
    /// A worker joined the catalog.
    WorkerRegistered {
        /// Id of the new worker.
        worker_id: String,
    },
    /// A worker left the catalog.
    WorkerDeregistered {
        /// Id of the removed worker.
        worker_id: String,
        /// Attempts still running on it when it left.
        stranded: usize,
    },
    /// A worker moved between statuses.
    WorkerStatusChanged {
        /// Id of the worker.
        worker_id: String,
        /// Previous status.
        from: WorkerStatus,
        /// New status.
        to: WorkerStatus,
    },
    /// A task produced a successful outcome.
    TaskCompleted {
        /// Id of the task.
        task_id: Uuid,
        /// Worker that won arbitration.
        worker_id: String,
        /// Winner confidence.
        confidence: f64,
        /// Pattern the task ran under.
        pattern: Option<OrchestrationPattern>,
    },
    /// A task produced a failed outcome.
    TaskFailed {
        /// Id of the task.
        task_id: Uuid,
        /// Number of attempt errors.
        errors: usize,
        /// Pattern the task ran under.
        pattern: Option<OrchestrationPattern>,
    },
}

/// Sizing for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Events buffered per subscriber before the slowest one starts lagging.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Receivers allowed at once; further subscribes fail.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,
}

fn default_capacity() -> usize {
    256
}

fn default_max_subscribers() -> usize {
    32
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_subscribers: default_max_subscribers(),
        }
    }
}

/// Bounded publish/subscribe channel for [`EngineEvent`]s.
///
/// Publishing never waits: with no subscribers the event is dropped, and a
/// subscriber that falls behind sees `RecvError::Lagged` instead of slowing
/// the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    max_subscribers: usize,
}

impl EventBus {
    /// A bus with no subscribers.
    pub fn new(config: &EventBusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.capacity.max(1));
        Self {
            tx,
            max_subscribers: config.max_subscribers,
        }
    }

    /// Add a subscriber, up to the configured limit.
    pub fn subscribe(&self) -> QuorumResult<broadcast::Receiver<EngineEvent>> {
        if self.tx.receiver_count() >= self.max_subscribers {
            return Err(QuorumError::Resource(format!(
                "event subscriber limit of {} reached",
                self.max_subscribers
            )));
        }
        Ok(self.tx.subscribe())
    }

    /// Publish to current subscribers. Never blocks; with none it is a no-op.
    pub fn emit(&self, event: EngineEvent) {
        debug!(event = ?event, "engine event");
        let _ = self.tx.send(event);
    }

    /// Receivers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventBusConfig::default())
    }
}
