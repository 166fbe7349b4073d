use crate::events::{EngineEvent, EventBus};
use crate::store::CatalogStore;
use crate::types::{
    Capability, ExecutionRecord, ResourceNeeds, WorkerDescriptor, WorkerStatus,
};
use crate::worker::{Worker, WorkerFactory};
use chrono::Utc;
use parking_lot::RwLock;
use quorum_core::{QuorumError, QuorumResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// How a task type is matched against capability names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Case-insensitive tag equality only.
    Exact,
    /// Exact first, then bidirectional case-insensitive substring.
    #[default]
    Fuzzy,
}

/// What the host can offer a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResources {
    /// Memory available per worker, in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// CPU cores available per worker.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    /// Whether a GPU is present.
    #[serde(default)]
    pub gpu: bool,
    /// Whether outbound network access is allowed.
    #[serde(default = "default_network")]
    pub network: bool,
    /// Upper bound on any worker's declared concurrency.
    #[serde(default = "default_host_concurrency")]
    pub max_concurrent_tasks: usize,
}

fn default_memory_mb() -> u64 {
    16_384
}
fn default_cpu_cores() -> f64 {
    8.0
}
fn default_network() -> bool {
    true
}
fn default_host_concurrency() -> usize {
    64
}

impl Default for HostResources {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            gpu: false,
            network: default_network(),
            max_concurrent_tasks: default_host_concurrency(),
        }
    }
}

impl HostResources {
    /// Reject resource needs this host cannot satisfy.
    pub fn check(&self, needs: &ResourceNeeds) -> QuorumResult<()> {
        if needs.max_concurrent_tasks == 0 {
            return Err(QuorumError::Resource(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if needs.max_concurrent_tasks > self.max_concurrent_tasks {
            return Err(QuorumError::Resource(format!(
                "max_concurrent_tasks {} exceeds host limit {}",
                needs.max_concurrent_tasks, self.max_concurrent_tasks
            )));
        }
        if needs.memory_mb > self.memory_mb {
            return Err(QuorumError::Resource(format!(
                "needs {} MB memory, host offers {} MB",
                needs.memory_mb, self.memory_mb
            )));
        }
        if !needs.cpu_cores.is_finite() || needs.cpu_cores < 0.0 || needs.cpu_cores > self.cpu_cores
        {
            return Err(QuorumError::Resource(format!(
                "needs {} cpu cores, host offers {}",
                needs.cpu_cores, self.cpu_cores
            )));
        }
        if needs.gpu && !self.gpu {
            return Err(QuorumError::Resource("needs a GPU, host has none".into()));
        }
        if needs.network && !self.network {
            return Err(QuorumError::Resource(
                "needs network access, host has none".into(),
            ));
        }
        Ok(())
    }
}

/// Reject malformed worker definitions.
pub fn validate_descriptor(descriptor: &WorkerDescriptor) -> QuorumResult<()> {
    if descriptor.id.trim().is_empty() {
        return Err(QuorumError::Validation("worker id is required".into()));
    }
    if descriptor.name.trim().is_empty() {
        return Err(QuorumError::Validation(format!(
            "worker '{}' has no name",
            descriptor.id
        )));
    }
    if descriptor.kind.trim().is_empty() {
        return Err(QuorumError::Validation(format!(
            "worker '{}' has no kind",
            descriptor.id
        )));
    }
    if descriptor.capabilities.is_empty() {
        return Err(QuorumError::Validation(format!(
            "worker '{}' declares no capabilities",
            descriptor.id
        )));
    }
    for cap in &descriptor.capabilities {
        if cap.name.trim().is_empty() {
            return Err(QuorumError::Validation(format!(
                "worker '{}' declares a capability without a name",
                descriptor.id
            )));
        }
        if !(0.0..=1.0).contains(&cap.confidence) {
            return Err(QuorumError::Validation(format!(
                "capability '{}' of worker '{}' has confidence {} outside [0, 1]",
                cap.name, descriptor.id, cap.confidence
            )));
        }
    }
    Ok(())
}

/// Find the capability of `descriptor` that answers `task_type`.
pub fn match_capability<'a>(
    descriptor: &'a WorkerDescriptor,
    task_type: &str,
    mode: MatchMode,
) -> Option<&'a Capability> {
    let wanted = task_type.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    let exact = descriptor
        .capabilities
        .iter()
        .find(|c| c.name.trim().to_lowercase() == wanted);
    if exact.is_some() || mode == MatchMode::Exact {
        return exact;
    }
    descriptor.capabilities.iter().find(|c| {
        let name = c.name.trim().to_lowercase();
        !name.is_empty() && (name.contains(&wanted) || wanted.contains(&name))
    })
}

/// A worker selected for a task, with the state it had when ranked.
#[derive(Clone)]
pub struct Candidate {
    /// The live worker.
    pub worker: Arc<dyn Worker>,
    /// Descriptor at ranking time.
    pub descriptor: WorkerDescriptor,
    /// The capability that matched the task type.
    pub capability: Capability,
    /// Attempts in flight at ranking time.
    pub load: usize,
}

impl Candidate {
    /// Worker id.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Worker ranking priority.
    pub fn priority(&self) -> u32 {
        self.descriptor.priority
    }

    /// Pipeline stage key of the matched capability.
    pub fn category(&self) -> &str {
        self.capability.category_key()
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("id", &self.descriptor.id)
            .field("capability", &self.capability.name)
            .field("priority", &self.descriptor.priority)
            .field("load", &self.load)
            .finish()
    }
}

fn rank_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.load.cmp(&b.load))
        .then_with(|| {
            b.capability
                .success_rate
                .total_cmp(&a.capability.success_rate)
        })
        .then_with(|| a.id().cmp(b.id()))
}

/// Point-in-time view of one worker, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Registered descriptor, including learned success rates.
    pub descriptor: WorkerDescriptor,
    /// Current status.
    pub status: WorkerStatus,
    /// Attempts in flight.
    pub load: usize,
    /// Records for those attempts.
    pub in_flight: Vec<ExecutionRecord>,
}

/// Holds one unit of a worker's load. Dropping it removes the execution
/// record, so load is released even when the attempt outlived its timeout.
pub struct LoadSlot {
    catalog: Weak<CapabilityCatalog>,
    worker_id: String,
    execution_id: Uuid,
}

impl LoadSlot {
    /// Id of the execution record this slot holds.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

impl Drop for LoadSlot {
    fn drop(&mut self) {
        if let Some(catalog) = self.catalog.upgrade() {
            catalog.finish_execution(&self.worker_id, self.execution_id);
        }
    }
}

struct CatalogEntry {
    registration: Uuid,
    worker: Arc<dyn Worker>,
    descriptor: WorkerDescriptor,
    status: WorkerStatus,
    in_flight: HashMap<Uuid, ExecutionRecord>,
    monitor: Option<JoinHandle<()>>,
}

/// Catalog tuning taken from the engine config.
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    /// What the host offers each worker.
    pub host: HostResources,
    /// How task types match capability names.
    pub matching: MatchMode,
    /// Bound on any single health probe.
    pub probe_timeout: Duration,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            host: HostResources::default(),
            matching: MatchMode::default(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Registry of workers, their abilities, live status and in-flight load.
///
/// All state sits behind one lock that is only held for single-step
/// updates and is never held across an `.await`.
pub struct CapabilityCatalog {
    entries: RwLock<HashMap<String, CatalogEntry>>,
    settings: CatalogSettings,
    store: Option<Arc<dyn CatalogStore>>,
    events: EventBus,
}

impl CapabilityCatalog {
    /// An empty catalog. `reload` restores persisted registrations.
    pub fn new(
        settings: CatalogSettings,
        store: Option<Arc<dyn CatalogStore>>,
        events: EventBus,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            settings,
            store,
            events,
        }
    }

    /// Register a worker, probe it once, persist it and start monitoring.
    pub async fn register(
        self: &Arc<Self>,
        worker: Arc<dyn Worker>,
        health_interval: Option<Duration>,
    ) -> QuorumResult<()> {
        let descriptor = worker.descriptor().clone();
        self.register_with_descriptor(worker, descriptor, health_interval)
            .await
    }

    async fn register_with_descriptor(
        self: &Arc<Self>,
        worker: Arc<dyn Worker>,
        descriptor: WorkerDescriptor,
        health_interval: Option<Duration>,
    ) -> QuorumResult<()> {
        validate_descriptor(&descriptor)?;
        self.settings.host.check(&descriptor.resources).map_err(|e| match e {
            QuorumError::Resource(msg) => {
                QuorumError::Resource(format!("worker '{}': {msg}", descriptor.id))
            }
            other => other,
        })?;

        let worker_id = descriptor.id.clone();
        let registration = Uuid::new_v4();
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&worker_id) {
                return Err(QuorumError::Validation(format!(
                    "worker '{worker_id}' is already registered"
                )));
            }
            entries.insert(
                worker_id.clone(),
                CatalogEntry {
                    registration,
                    worker: worker.clone(),
                    descriptor: descriptor.clone(),
                    status: WorkerStatus::Initializing,
                    in_flight: HashMap::new(),
                    monitor: None,
                },
            );
        }

        let healthy = self.probe(worker.as_ref()).await;
        if !self.holds_registration(&worker_id, registration) {
            return Err(abandoned_registration(&worker_id));
        }
        self.apply_health(&worker_id, healthy);

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&descriptor).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to persist worker registration");
            }
            if !self.holds_registration(&worker_id, registration) {
                if let Err(e) = store.remove(&worker_id).await {
                    warn!(worker_id = %worker_id, error = %e, "Failed to remove abandoned registration");
                }
                return Err(abandoned_registration(&worker_id));
            }
        }

        if let Some(interval) = health_interval {
            let handle = self.spawn_health_monitor(worker_id.clone(), interval);
            let mut entries = self.entries.write();
            match entries
                .get_mut(&worker_id)
                .filter(|entry| entry.registration == registration)
            {
                Some(entry) => entry.monitor = Some(handle),
                None => handle.abort(),
            }
        }

        info!(
            worker_id = %worker_id,
            capabilities = descriptor.capabilities.len(),
            healthy,
            "Registered worker"
        );
        self.events
            .emit(EngineEvent::WorkerRegistered { worker_id });
        Ok(())
    }

    /// Rebuild workers from the persisted registrations.
    ///
    /// Learned success rates come from the stored descriptor, not from the
    /// freshly built worker. Returns the number of workers restored.
    pub async fn reload(
        self: &Arc<Self>,
        factory: &dyn WorkerFactory,
        health_interval: Option<Duration>,
    ) -> QuorumResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let descriptors = store.load_all().await?;
        let mut restored = 0;
        for descriptor in descriptors {
            let Some(worker) = factory.build(&descriptor) else {
                warn!(worker_id = %descriptor.id, kind = %descriptor.kind, "No factory for persisted worker kind");
                continue;
            };
            let worker_id = descriptor.id.clone();
            match self
                .register_with_descriptor(worker, descriptor, health_interval)
                .await
            {
                Ok(()) => restored += 1,
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Failed to restore worker"),
            }
        }
        Ok(restored)
    }

    /// Take a worker out of service, wait for its load to drain, then remove it.
    ///
    /// After `drain_timeout` removal proceeds anyway and any stranded
    /// execution records are logged. Unknown ids are a no-op returning `false`.
    pub async fn deregister(&self, worker_id: &str, drain_timeout: Duration) -> QuorumResult<bool> {
        if !self.contains(worker_id) {
            debug!(worker_id = %worker_id, "Deregister of unknown worker ignored");
            return Ok(false);
        }
        self.set_status(worker_id, WorkerStatus::Offline)?;

        let started = Instant::now();
        while self.load(worker_id) > 0 && started.elapsed() < drain_timeout {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let Some(entry) = self.entries.write().remove(worker_id) else {
            return Ok(false);
        };
        if let Some(monitor) = entry.monitor {
            monitor.abort();
        }
        let stranded = entry.in_flight.len();
        for record in entry.in_flight.values() {
            warn!(
                worker_id = %worker_id,
                task_id = %record.task_id,
                execution_id = %record.execution_id,
                started_at = %record.started_at,
                "Stranded execution after drain timeout"
            );
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.remove(worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to remove persisted registration");
            }
        }

        info!(worker_id = %worker_id, stranded, "Deregistered worker");
        self.events.emit(EngineEvent::WorkerDeregistered {
            worker_id: worker_id.to_string(),
            stranded,
        });
        Ok(true)
    }

    /// Workers able to take `task_type`, best first.
    ///
    /// Ranked by priority (desc), current load (asc), success rate of the
    /// matched capability (desc), then id.
    pub fn find_candidates(&self, task_type: &str) -> QuorumResult<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = {
            let entries = self.entries.read();
            entries
                .values()
                .filter(|e| e.status.accepts_work())
                .filter_map(|e| {
                    match_capability(&e.descriptor, task_type, self.settings.matching).map(|cap| {
                        Candidate {
                            worker: e.worker.clone(),
                            descriptor: e.descriptor.clone(),
                            capability: cap.clone(),
                            load: e.in_flight.len(),
                        }
                    })
                })
                .collect()
        };

        if candidates.is_empty() {
            return Err(QuorumError::NoCapableWorker(task_type.to_string()));
        }
        candidates.sort_by(rank_candidates);
        Ok(candidates)
    }

    /// Reserve one unit of load on a worker.
    ///
    /// Returns `None` when the worker is gone, not accepting work, or already
    /// at its declared concurrency.
    pub fn begin_execution(self: &Arc<Self>, worker_id: &str, task_id: Uuid) -> Option<LoadSlot> {
        let (execution_id, became_busy) = {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(worker_id)?;
            if !entry.status.accepts_work()
                || entry.in_flight.len() >= entry.descriptor.resources.max_concurrent_tasks
            {
                return None;
            }
            let record = ExecutionRecord {
                execution_id: Uuid::new_v4(),
                task_id,
                worker_id: worker_id.to_string(),
                started_at: Utc::now(),
            };
            let execution_id = record.execution_id;
            entry.in_flight.insert(execution_id, record);
            let became_busy = entry.status == WorkerStatus::Ready;
            if became_busy {
                entry.status = WorkerStatus::Busy;
            }
            (execution_id, became_busy)
        };

        if became_busy {
            self.emit_status(worker_id, WorkerStatus::Ready, WorkerStatus::Busy);
        }
        Some(LoadSlot {
            catalog: Arc::downgrade(self),
            worker_id: worker_id.to_string(),
            execution_id,
        })
    }

    fn finish_execution(&self, worker_id: &str, execution_id: Uuid) {
        let became_ready = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(worker_id) else {
                return;
            };
            entry.in_flight.remove(&execution_id);
            let idle = entry.in_flight.is_empty() && entry.status == WorkerStatus::Busy;
            if idle {
                entry.status = WorkerStatus::Ready;
            }
            idle
        };
        if became_ready {
            self.emit_status(worker_id, WorkerStatus::Busy, WorkerStatus::Ready);
        }
    }

    /// Move a worker to a new status along an allowed transition.
    pub fn set_status(&self, worker_id: &str, next: WorkerStatus) -> QuorumResult<()> {
        let from = {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(worker_id).ok_or_else(|| {
                QuorumError::Validation(format!("unknown worker '{worker_id}'"))
            })?;
            let from = entry.status;
            if !from.can_transition_to(next) {
                return Err(QuorumError::Validation(format!(
                    "worker '{worker_id}' cannot move from {from} to {next}"
                )));
            }
            entry.status = next;
            from
        };
        if from != next {
            self.emit_status(worker_id, from, next);
        }
        Ok(())
    }

    /// Nudge a capability's success rate with an exponential moving average.
    /// Returns the new rate, or `None` if the worker or capability is gone.
    pub fn update_success_rate(
        &self,
        worker_id: &str,
        capability: &str,
        success: bool,
        alpha: f64,
    ) -> Option<f64> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(worker_id)?;
        let cap = entry
            .descriptor
            .capabilities
            .iter_mut()
            .find(|c| c.name == capability)?;
        let observed = if success { 1.0 } else { 0.0 };
        cap.success_rate = alpha * observed + (1.0 - alpha) * cap.success_rate;
        Some(cap.success_rate)
    }

    /// Write the worker's current descriptor (with learned rates) to the store.
    pub async fn persist(&self, worker_id: &str) -> QuorumResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(descriptor) = self.descriptor(worker_id) else {
            return Ok(());
        };
        store.save(&descriptor).await
    }

    /// Abort every health monitor. Registrations are kept.
    pub fn shutdown(&self) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            if let Some(monitor) = entry.monitor.take() {
                monitor.abort();
            }
        }
    }

    /// Whether a worker with this id is registered.
    pub fn contains(&self, worker_id: &str) -> bool {
        self.entries.read().contains_key(worker_id)
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current status of a worker.
    pub fn status(&self, worker_id: &str) -> Option<WorkerStatus> {
        self.entries.read().get(worker_id).map(|e| e.status)
    }

    /// Number of attempts currently in flight on a worker.
    pub fn load(&self, worker_id: &str) -> usize {
        self.entries
            .read()
            .get(worker_id)
            .map_or(0, |e| e.in_flight.len())
    }

    /// Attempts in flight across all workers.
    pub fn total_load(&self) -> usize {
        self.entries.read().values().map(|e| e.in_flight.len()).sum()
    }

    /// Every execution record currently held.
    pub fn in_flight(&self) -> Vec<ExecutionRecord> {
        self.entries
            .read()
            .values()
            .flat_map(|e| e.in_flight.values().cloned())
            .collect()
    }

    /// A copy of a worker's descriptor.
    pub fn descriptor(&self, worker_id: &str) -> Option<WorkerDescriptor> {
        self.entries
            .read()
            .get(worker_id)
            .map(|e| e.descriptor.clone())
    }

    /// Per-worker state, sorted by id.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let entries = self.entries.read();
        let mut snapshot: Vec<WorkerSnapshot> = entries
            .values()
            .map(|e| WorkerSnapshot {
                descriptor: e.descriptor.clone(),
                status: e.status,
                load: e.in_flight.len(),
                in_flight: e.in_flight.values().cloned().collect(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        snapshot
    }

    /// Whether the entry for `worker_id` is still the one `registration` created.
    fn holds_registration(&self, worker_id: &str, registration: Uuid) -> bool {
        self.entries
            .read()
            .get(worker_id)
            .is_some_and(|entry| entry.registration == registration)
    }

    fn worker(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        self.entries.read().get(worker_id).map(|e| e.worker.clone())
    }

    async fn probe(&self, worker: &dyn Worker) -> bool {
        match tokio::time::timeout(self.settings.probe_timeout, worker.health_check()).await {
            Ok(report) => {
                if !report.healthy {
                    debug!(worker_id = %worker.descriptor().id, issues = ?report.issues, "Health probe failed");
                }
                report.healthy
            }
            Err(_) => false,
        }
    }

    fn apply_health(&self, worker_id: &str, healthy: bool) {
        let (from, to) = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(worker_id) else {
                return;
            };
            let next = match (entry.status, healthy) {
                (WorkerStatus::Initializing, true) | (WorkerStatus::Error, true) => {
                    WorkerStatus::Ready
                }
                (WorkerStatus::Initializing, false)
                | (WorkerStatus::Ready, false)
                | (WorkerStatus::Busy, false) => WorkerStatus::Error,
                _ => return,
            };
            let from = entry.status;
            entry.status = next;
            (from, next)
        };
        self.emit_status(worker_id, from, to);
    }

    fn spawn_health_monitor(self: &Arc<Self>, worker_id: String, interval: Duration) -> JoinHandle<()> {
        let catalog = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(catalog) = catalog.upgrade() else {
                    break;
                };
                let Some(worker) = catalog.worker(&worker_id) else {
                    break;
                };
                let healthy = catalog.probe(worker.as_ref()).await;
                catalog.apply_health(&worker_id, healthy);
            }
        })
    }

    fn emit_status(&self, worker_id: &str, from: WorkerStatus, to: WorkerStatus) {
        debug!(worker_id = %worker_id, from = %from, to = %to, "Worker status changed");
        self.events.emit(EngineEvent::WorkerStatusChanged {
            worker_id: worker_id.to_string(),
            from,
            to,
        });
    }
}

fn abandoned_registration(worker_id: &str) -> QuorumError {
    QuorumError::Validation(format!(
        "worker '{worker_id}' was deregistered before its registration completed"
    ))
}
