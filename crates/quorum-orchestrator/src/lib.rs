//! Capability-based task orchestration.
//!
//! Tasks are matched against a catalog of workers by the capabilities they
//! declare, executed under one of several dispatch patterns, and the
//! competing results are arbitrated into a single outcome. Outcomes feed
//! back into each worker's success rate, which in turn shapes future ranking.
//!
//! # Main types
//!
//! - [`Orchestrator`] - Caller-facing engine: lifecycle, registration, task submission.
//! - [`CapabilityCatalog`] - Worker registry with health status and load accounting.
//! - [`ExecutionEnvelope`] - Guards one attempt with a health gate, load slot and timeout.
//! - [`PatternExecutor`] - Sequential, concurrent, hierarchical, pipeline and scatter-gather dispatch.
//! - [`ResultArbiter`] - Confidence-based selection among competing results.
//! - [`OutcomeRecorder`] - Background feedback of outcomes into the catalog.
//! - [`StrategyArbiter`] - Runs competing problem-solving strategies and remembers winners.

/// Confidence-based result arbitration.
pub mod arbiter;
/// Staged tasks, dependency checks and cached outcomes.
pub mod board;
/// Cooperative cancellation.
pub mod cancel;
/// Worker registry, matching and load accounting.
pub mod catalog;
/// Engine configuration.
pub mod config;
/// The orchestrator engine.
pub mod engine;
/// Per-attempt execution guard.
pub mod envelope;
/// Typed telemetry events.
pub mod events;
/// Dispatch patterns and scatter-gather aggregators.
pub mod patterns;
/// Outcome feedback and strategy priors.
pub mod recorder;
/// Durable storage for registrations and outcomes.
pub mod store;
/// Competing strategies for a shared problem.
pub mod strategy;
/// Tasks, workers, results and outcomes.
pub mod types;
/// The worker contract.
pub mod worker;

#[cfg(test)]
mod test_support;

pub use arbiter::{Arbitration, ArbitrationPolicy, ResultArbiter};
pub use board::TaskBoard;
pub use cancel::CancelToken;
pub use catalog::{
    Candidate, CapabilityCatalog, CatalogSettings, HostResources, LoadSlot, MatchMode,
    WorkerSnapshot,
};
pub use config::EngineConfig;
pub use engine::{EngineSnapshot, EngineState, Orchestrator, Persistence};
pub use envelope::ExecutionEnvelope;
pub use events::{EngineEvent, EventBus, EventBusConfig};
pub use patterns::{
    select_pattern, Aggregator, CollectAggregator, ExecutorSettings, MergeObjectsAggregator,
    PatternExecutor, RetryPolicy,
};
pub use recorder::OutcomeRecorder;
pub use store::{CatalogStore, FileCatalogStore, JsonlOutcomeLog, OutcomeLog};
pub use strategy::{Problem, Strategy, StrategyAnswer, StrategyArbiter};
pub use types::{
    AttemptResult, AttemptSummary, Capability, ExecutionRecord, HealthReport,
    OrchestrationPattern, Outcome, OutcomeRecord, ResourceNeeds, ResourceUsage, Task,
    TaskContext, WorkerDescriptor, WorkerReport, WorkerStatus,
};
pub use worker::{Worker, WorkerFactory};
