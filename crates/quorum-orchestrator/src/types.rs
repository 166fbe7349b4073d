use chrono::{DateTime, Utc};
use quorum_core::{AttemptError, ErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Registered, initial health check pending.
    Initializing,
    /// Healthy and idle.
    Ready,
    /// Healthy with at least one attempt running.
    Busy,
    /// Last health check failed.
    Error,
    /// Deregistered or unreachable.
    Offline,
    /// Taken out of rotation by an operator.
    Maintenance,
}

impl WorkerStatus {
    /// Whether the catalog may move a worker from `self` to `next`.
    ///
    /// Busy is only reachable from ready; a worker coming back from error,
    /// offline or maintenance passes through ready first.
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Offline) | (_, Maintenance) => true,
            (Initializing, Ready) | (Initializing, Error) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready, Error) | (Busy, Error) => true,
            (Error, Ready) | (Offline, Ready) | (Maintenance, Ready) => true,
            _ => false,
        }
    }

    /// Whether the worker may be offered new attempts.
    pub fn accepts_work(self) -> bool {
        matches!(self, WorkerStatus::Ready | WorkerStatus::Busy)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Initializing => write!(f, "initializing"),
            WorkerStatus::Ready => write!(f, "ready"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Error => write!(f, "error"),
            WorkerStatus::Offline => write!(f, "offline"),
            WorkerStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// A named ability a worker declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability tag matched against `Task::task_type`.
    pub name: String,
    /// Grouping used to partition pipeline stages; falls back to `name`.
    #[serde(default)]
    pub category: Option<String>,
    /// Self-declared confidence in [0, 1].
    pub confidence: f64,
    /// Rolling success rate maintained by the outcome recorder.
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
}

fn default_success_rate() -> f64 {
    1.0
}

impl Capability {
    /// A capability with no category and a perfect success rate.
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            category: None,
            confidence,
            success_rate: default_success_rate(),
        }
    }

    /// Group this capability under a pipeline stage.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// The stage key used when partitioning a pipeline.
    pub fn category_key(&self) -> &str {
        self.category.as_deref().unwrap_or(&self.name)
    }
}

/// Resources a worker needs from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNeeds {
    /// Memory required, in megabytes.
    #[serde(default)]
    pub memory_mb: u64,
    /// CPU cores required; fractional values allowed.
    #[serde(default)]
    pub cpu_cores: f64,
    /// Whether a GPU is required.
    #[serde(default)]
    pub gpu: bool,
    /// Whether outbound network access is required.
    #[serde(default)]
    pub network: bool,
    /// Attempts the worker accepts at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
}

fn default_max_concurrent() -> usize {
    1
}

impl Default for ResourceNeeds {
    fn default() -> Self {
        Self {
            memory_mb: 0,
            cpu_cores: 0.0,
            gpu: false,
            network: false,
            max_concurrent_tasks: default_max_concurrent(),
        }
    }
}

/// Static description of a worker: identity, abilities and needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Unique within a catalog.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form worker family (e.g. "vision", "pattern-learner").
    pub kind: String,
    /// Abilities the worker declares.
    pub capabilities: Vec<Capability>,
    /// Higher wins ties during ranking.
    #[serde(default)]
    pub priority: u32,
    /// Host resources the worker needs.
    #[serde(default)]
    pub resources: ResourceNeeds,
}

impl WorkerDescriptor {
    /// A descriptor with no capabilities, priority 0 and default resources.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            capabilities: Vec::new(),
            priority: 0,
            resources: ResourceNeeds::default(),
        }
    }

    /// Declare another capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Set the ranking priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the resource needs.
    pub fn with_resources(mut self, resources: ResourceNeeds) -> Self {
        self.resources = resources;
        self
    }

    /// Cap the number of concurrent attempts.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.resources.max_concurrent_tasks = max;
        self
    }
}

/// Answer to a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether the worker may take work.
    pub healthy: bool,
    /// Reasons the check failed, if any.
    #[serde(default)]
    pub issues: Vec<String>,
}

impl HealthReport {
    /// A passing report.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            issues: Vec::new(),
        }
    }

    /// A failing report listing what went wrong.
    pub fn unhealthy(issues: Vec<String>) -> Self {
        Self {
            healthy: false,
            issues,
        }
    }
}

/// Dispatch pattern used to execute a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestrationPattern {
    /// Try candidates one at a time until one succeeds.
    Sequential,
    /// Fan out to several candidates at once and arbitrate.
    Concurrent,
    /// Resolve dependencies first, then run sequentially.
    Hierarchical,
    /// Chain stages, feeding each result into the next stage.
    Pipeline,
    /// Fan out to every candidate and merge the successes.
    ScatterGather,
    /// One attempt against the top candidate; used for monitor/reactive tasks.
    #[serde(alias = "event-driven", alias = "reactive", alias = "monitor")]
    SingleShot,
}

impl std::fmt::Display for OrchestrationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationPattern::Sequential => write!(f, "sequential"),
            OrchestrationPattern::Concurrent => write!(f, "concurrent"),
            OrchestrationPattern::Hierarchical => write!(f, "hierarchical"),
            OrchestrationPattern::Pipeline => write!(f, "pipeline"),
            OrchestrationPattern::ScatterGather => write!(f, "scatter-gather"),
            OrchestrationPattern::SingleShot => write!(f, "single-shot"),
        }
    }
}

/// Routing context carried by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// Shared by a task and everything spawned from it.
    pub correlation_id: Uuid,
    /// Retry passes already spent.
    #[serde(default)]
    pub retry_count: u32,
    /// Extra full passes over the candidates after every attempt failed.
    #[serde(default)]
    pub max_retries: u32,
    /// Pattern requested by the submitter; inferred when unset.
    #[serde(default)]
    pub orchestration_pattern: Option<OrchestrationPattern>,
    /// Task that spawned this one.
    #[serde(default)]
    pub parent_task: Option<Uuid>,
    /// Tasks spawned by this one.
    #[serde(default)]
    pub child_tasks: Vec<Uuid>,
    /// Per-attempt timeout; the engine default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Fan-out for the concurrent pattern.
    #[serde(default)]
    pub max_fanout: Option<usize>,
    /// Explicit capability tags, one per pipeline stage, in order.
    #[serde(default)]
    pub pipeline_stages: Vec<String>,
    /// Index of the pipeline stage this copy of the task belongs to.
    #[serde(default)]
    pub pipeline_stage: Option<usize>,
    /// Name of a registered aggregator for scatter-gather.
    #[serde(default)]
    pub aggregation: Option<String>,
    /// The failed attempt that preceded this one in a sequential run.
    #[serde(default)]
    pub previous_result: Option<Box<AttemptResult>>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            retry_count: 0,
            max_retries: 0,
            orchestration_pattern: None,
            parent_task: None,
            child_tasks: Vec::new(),
            timeout_ms: None,
            max_fanout: None,
            pipeline_stages: Vec::new(),
            pipeline_stage: None,
            aggregation: None,
            previous_result: None,
        }
    }
}

/// A unit of work routed to a matching worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id; outcomes are keyed by it.
    pub id: Uuid,
    /// Type tag matched against worker capabilities.
    pub task_type: String,
    /// 0 (lowest) to 10 (highest).
    #[serde(default)]
    pub priority: u8,
    /// Opaque input handed to the worker.
    pub payload: serde_json::Value,
    /// Attempt timeouts are shortened to end here.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Tasks that must have an outcome before this one runs.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Routing context.
    #[serde(default)]
    pub context: TaskContext,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// A task with default priority and a fresh id.
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            priority: 5,
            payload,
            deadline: None,
            dependencies: Vec::new(),
            context: TaskContext::default(),
            created_at: Utc::now(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Request a dispatch pattern.
    pub fn with_pattern(mut self, pattern: OrchestrationPattern) -> Self {
        self.context.orchestration_pattern = Some(pattern);
        self
    }

    /// Require outcomes for `deps` before running.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.context.timeout_ms = Some(timeout_ms);
        self
    }

    /// Cap concurrent fan-out.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.context.max_fanout = Some(fanout);
        self
    }

    /// Run as a pipeline over the given capability tags.
    pub fn with_pipeline_stages(mut self, stages: Vec<String>) -> Self {
        self.context.pipeline_stages = stages;
        self
    }

    /// Merge scatter-gather results with a registered aggregator.
    pub fn with_aggregation(mut self, name: impl Into<String>) -> Self {
        self.context.aggregation = Some(name.into());
        self
    }

    /// Allow extra passes over the candidates after all fail.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.context.max_retries = retries;
        self
    }

    /// Mark this task as spawned by `parent`.
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.context.parent_task = Some(parent);
        self
    }
}

/// What a worker reports back from `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Whether the worker considers the attempt successful.
    pub success: bool,
    /// Result produced by the worker.
    pub payload: serde_json::Value,
    /// Worker confidence in [0, 1].
    pub confidence: f64,
    /// Resources the attempt consumed.
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Worker-side error messages.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl WorkerReport {
    /// A successful report.
    pub fn success(payload: serde_json::Value, confidence: f64) -> Self {
        Self {
            success: true,
            payload,
            confidence,
            resource_usage: ResourceUsage::default(),
            errors: Vec::new(),
        }
    }

    /// A failed report with one message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: serde_json::Value::Null,
            confidence: 0.0,
            resource_usage: ResourceUsage::default(),
            errors: vec![message.into()],
        }
    }

    /// Attach resource usage.
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.resource_usage = usage;
        self
    }
}

/// Resources consumed by one attempt, as reported by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time in milliseconds.
    pub cpu_ms: u64,
    /// Peak memory in megabytes.
    pub memory_mb: u64,
    /// Bytes sent and received.
    pub network_bytes: u64,
}

impl ResourceUsage {
    /// Component-wise sum.
    pub fn combine(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_ms: self.cpu_ms.saturating_add(other.cpu_ms),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            network_bytes: self.network_bytes.saturating_add(other.network_bytes),
        }
    }
}

/// The result of one worker's attempt at one task. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    /// Task the attempt belongs to.
    pub task_id: Uuid,
    /// Worker that ran the attempt.
    pub worker_id: String,
    /// Capability the worker was selected for.
    pub capability: Option<String>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Worker output; null on failure.
    pub payload: serde_json::Value,
    /// Worker confidence in [0, 1].
    pub confidence: f64,
    /// Time from dispatch to completion.
    pub elapsed_ms: u64,
    /// Resources the attempt consumed.
    pub resource_usage: ResourceUsage,
    /// Errors raised during the attempt.
    pub errors: Vec<AttemptError>,
    /// When the attempt settled.
    pub completed_at: DateTime<Utc>,
}

impl AttemptResult {
    /// A failed attempt carrying a single error.
    pub fn failure(
        task_id: Uuid,
        worker_id: impl Into<String>,
        capability: Option<String>,
        error: AttemptError,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            task_id,
            worker_id: worker_id.into(),
            capability,
            success: false,
            payload: serde_json::Value::Null,
            confidence: 0.0,
            elapsed_ms,
            resource_usage: ResourceUsage::default(),
            errors: vec![error],
            completed_at: Utc::now(),
        }
    }

    /// The kind of the first error, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.errors.first().map(|e| e.kind)
    }
}

/// Compact per-attempt record kept on an outcome for feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    /// Worker that ran the attempt.
    pub worker_id: String,
    /// Capability the worker was selected for.
    pub capability: Option<String>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Confidence the worker reported.
    pub confidence: f64,
    /// Kind of the first error, if any.
    pub error_kind: Option<ErrorKind>,
}

impl From<&AttemptResult> for AttemptSummary {
    fn from(result: &AttemptResult) -> Self {
        Self {
            worker_id: result.worker_id.clone(),
            capability: result.capability.clone(),
            success: result.success,
            confidence: result.confidence,
            error_kind: result.error_kind(),
        }
    }
}

/// The engine's final, arbitrated answer for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Task this outcome answers.
    pub task_id: Uuid,
    /// Whether a winner was chosen.
    pub success: bool,
    /// The arbitrated winning attempt.
    pub winner: Option<AttemptResult>,
    /// Winner confidence, possibly boosted by corroboration.
    pub confidence: f64,
    /// Other successful attempts, best first.
    pub alternatives: Vec<AttemptResult>,
    /// Union of every failed attempt's errors; empty on success.
    pub errors: Vec<AttemptError>,
    /// Largest elapsed time among the arbitrated attempts.
    pub elapsed_ms: u64,
    /// Wall-clock time for the whole orchestration.
    pub wall_time_ms: u64,
    /// Every attempt made.
    pub attempts: Vec<AttemptSummary>,
    /// Pattern the task ran under.
    pub pattern: Option<OrchestrationPattern>,
    /// Why the arbiter chose as it did.
    pub rationale: String,
    /// When the outcome was produced.
    pub completed_at: DateTime<Utc>,
}

impl Outcome {
    /// A failure outcome produced without dispatching anything.
    pub fn failed(
        task_id: Uuid,
        pattern: Option<OrchestrationPattern>,
        errors: Vec<AttemptError>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            success: false,
            winner: None,
            confidence: 0.0,
            alternatives: Vec::new(),
            errors,
            elapsed_ms: 0,
            wall_time_ms: 0,
            attempts: Vec::new(),
            pattern,
            rationale: rationale.into(),
            completed_at: Utc::now(),
        }
    }

    /// Worker id of the winning attempt.
    pub fn winner_id(&self) -> Option<&str> {
        self.winner.as_ref().map(|w| w.worker_id.as_str())
    }
}

/// One line of the durable outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Task the outcome answers.
    pub task_id: Uuid,
    /// Winning worker, if any.
    pub worker_id: Option<String>,
    /// Whether the task succeeded.
    pub success: bool,
    /// Winner confidence.
    pub confidence: f64,
    /// Pattern the task ran under.
    pub pattern: Option<OrchestrationPattern>,
    /// Number of attempts made.
    pub attempts: usize,
    /// Number of attempt errors.
    pub errors: usize,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

impl From<&Outcome> for OutcomeRecord {
    fn from(outcome: &Outcome) -> Self {
        Self {
            task_id: outcome.task_id,
            worker_id: outcome.winner_id().map(str::to_string),
            success: outcome.success,
            confidence: outcome.confidence,
            pattern: outcome.pattern,
            attempts: outcome.attempts.len(),
            errors: outcome.errors.len(),
            recorded_at: Utc::now(),
        }
    }
}

/// An attempt in flight against a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Identifies this attempt.
    pub execution_id: Uuid,
    /// Task being attempted.
    pub task_id: Uuid,
    /// Worker running the attempt.
    pub worker_id: String,
    /// Dispatch time.
    pub started_at: DateTime<Utc>,
}
