use crate::types::{Outcome, Task};
use quorum_core::{QuorumError, QuorumResult};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::watch;
use uuid::Uuid;

/// Result of trying to claim a task for execution.
pub enum Claim {
    /// The caller now owns the run and must call [`TaskBoard::finish`].
    Acquired,
    /// Someone else is running it; the receiver turns `true` when they finish.
    Running(watch::Receiver<bool>),
}

/// Staged tasks, tasks in progress, and the cached outcome of finished tasks.
///
/// A staged task is dropped once its outcome is recorded. The outcome cache
/// holds at most `capacity` entries and evicts the oldest first.
pub struct TaskBoard {
    tasks: HashMap<Uuid, Task>,
    outcomes: HashMap<Uuid, Outcome>,
    recorded: VecDeque<Uuid>,
    capacity: usize,
    in_progress: HashMap<Uuid, watch::Sender<bool>>,
}

impl TaskBoard {
    /// An empty board caching up to `capacity` outcomes.
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            outcomes: HashMap::new(),
            recorded: VecDeque::new(),
            capacity: capacity.max(1),
            in_progress: HashMap::new(),
        }
    }

    /// Stage a task so other tasks can depend on it.
    pub fn add(&mut self, task: Task) -> QuorumResult<Uuid> {
        let id = task.id;
        if self.outcomes.contains_key(&id) {
            return Err(QuorumError::Validation(format!(
                "task {id} already has an outcome"
            )));
        }
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// A staged task that has no outcome yet.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// The cached outcome for `id`, unless evicted.
    pub fn outcome(&self, id: Uuid) -> Option<&Outcome> {
        self.outcomes.get(&id)
    }

    /// Cache an outcome and release the staged task it resolves.
    pub fn record_outcome(&mut self, outcome: Outcome) {
        let id = outcome.task_id;
        self.tasks.remove(&id);
        if self.outcomes.insert(id, outcome).is_none() {
            self.recorded.push_back(id);
        }
        while self.recorded.len() > self.capacity {
            if let Some(oldest) = self.recorded.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
    }

    /// Claim a task for execution.
    pub fn begin(&mut self, id: Uuid) -> Claim {
        match self.in_progress.entry(id) {
            Entry::Occupied(running) => Claim::Running(running.get().subscribe()),
            Entry::Vacant(slot) => {
                let (tx, _rx) = watch::channel(false);
                slot.insert(tx);
                Claim::Acquired
            }
        }
    }

    /// Release a claim and wake everyone waiting on it.
    pub fn finish(&mut self, id: Uuid) {
        if let Some(done) = self.in_progress.remove(&id) {
            done.send_replace(true);
        }
    }

    /// Whether some submission holds the claim on `id`.
    pub fn is_in_progress(&self, id: Uuid) -> bool {
        self.in_progress.contains_key(&id)
    }

    /// Claims currently held.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    /// Staged tasks still waiting for an outcome.
    pub fn staged_count(&self) -> usize {
        self.tasks.len()
    }

    /// Outcomes currently cached.
    pub fn outcome_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Cached outcomes, oldest first.
    pub fn outcomes(&self) -> Vec<&Outcome> {
        self.recorded
            .iter()
            .filter_map(|id| self.outcomes.get(id))
            .collect()
    }

    /// Walk the dependency graph below `task`.
    ///
    /// Returns the dependencies that still need an outcome, deepest first,
    /// so running them in order satisfies every edge. Tasks that already
    /// have an outcome are not descended into.
    pub fn check_dependencies(&self, task: &Task, max_depth: usize) -> QuorumResult<Vec<Uuid>> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut path = vec![task.id];
        for &dep in &task.dependencies {
            self.visit(dep, 1, max_depth, &mut path, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        id: Uuid,
        depth: usize,
        max_depth: usize,
        path: &mut Vec<Uuid>,
        done: &mut HashSet<Uuid>,
        order: &mut Vec<Uuid>,
    ) -> QuorumResult<()> {
        if let Some(start) = path.iter().position(|p| *p == id) {
            let cycle: Vec<String> = path[start..]
                .iter()
                .chain(std::iter::once(&id))
                .map(Uuid::to_string)
                .collect();
            return Err(QuorumError::DependencyCycle(cycle.join(" -> ")));
        }
        if done.contains(&id) || self.outcomes.contains_key(&id) {
            return Ok(());
        }
        if depth > max_depth {
            return Err(QuorumError::Validation(format!(
                "dependency chain deeper than {max_depth} at task {id}"
            )));
        }
        let task = self.tasks.get(&id).ok_or_else(|| {
            QuorumError::Validation(format!("unknown dependency {id}"))
        })?;

        path.push(id);
        for &dep in &task.dependencies {
            self.visit(dep, depth + 1, max_depth, path, done, order)?;
        }
        path.pop();

        done.insert(id);
        order.push(id);
        Ok(())
    }
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new(DEFAULT_OUTCOME_CAPACITY)
    }
}

/// Outcomes cached by [`TaskBoard::default`].
pub const DEFAULT_OUTCOME_CAPACITY: usize = 10_000;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use quorum_core::ErrorKind;

    fn task(deps: Vec<Uuid>) -> Task {
        Task::new("step", serde_json::Value::Null).with_dependencies(deps)
    }

    #[test]
    fn test_dependencies_deepest_first() {
        let mut board = TaskBoard::default();
        let a = task(vec![]);
        let b = task(vec![a.id]);
        let c = task(vec![a.id, b.id]);
        let (a_id, b_id) = (a.id, b.id);
        board.add(a).unwrap();
        board.add(b).unwrap();

        let order = board.check_dependencies(&c, 8).unwrap();
        assert_eq!(order, vec![a_id, b_id]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut board = TaskBoard::default();
        let mut a = task(vec![]);
        let b = task(vec![a.id]);
        a.dependencies.push(b.id);
        let root = task(vec![a.id]);
        board.add(a.clone()).unwrap();
        board.add(b.clone()).unwrap();

        let err = board.check_dependencies(&root, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
        assert_eq!(
            err.to_string(),
            QuorumError::DependencyCycle(format!("{} -> {} -> {}", a.id, b.id, a.id)).to_string()
        );
    }

    #[test]
    fn test_cycle_through_root() {
        let mut board = TaskBoard::default();
        let root_id = Uuid::new_v4();
        let dep = task(vec![root_id]);
        let mut root = task(vec![dep.id]);
        root.id = root_id;
        board.add(dep).unwrap();

        let err = board.check_dependencies(&root, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
    }

    #[test]
    fn test_unknown_dependency() {
        let board = TaskBoard::default();
        let err = board
            .check_dependencies(&task(vec![Uuid::new_v4()]), 8)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_depth_bound() {
        let mut board = TaskBoard::default();
        let mut previous: Option<Uuid> = None;
        for _ in 0..4 {
            let t = task(previous.into_iter().collect());
            previous = Some(t.id);
            board.add(t).unwrap();
        }
        let root = task(previous.into_iter().collect());
        assert!(board.check_dependencies(&root, 4).is_ok());
        let err = board.check_dependencies(&root, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_resolved_dependencies_skipped() {
        let mut board = TaskBoard::default();
        let a = task(vec![]);
        let a_id = a.id;
        board.add(a).unwrap();
        board.record_outcome(Outcome::failed(a_id, None, Vec::new(), "done"));

        let order = board.check_dependencies(&task(vec![a_id]), 8).unwrap();
        assert!(order.is_empty());
        assert!(board.add(task(vec![])).is_ok());

        let mut again = task(vec![]);
        again.id = a_id;
        assert_eq!(board.add(again).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_in_progress_claim() {
        let mut board = TaskBoard::default();
        let id = Uuid::new_v4();
        assert!(matches!(board.begin(id), Claim::Acquired));
        let Claim::Running(mut done) = board.begin(id) else {
            panic!("second claim should see the first");
        };
        assert!(board.is_in_progress(id));
        assert!(!*done.borrow_and_update());

        board.finish(id);
        assert!(*done.borrow_and_update());
        assert!(!board.is_in_progress(id));
        assert!(matches!(board.begin(id), Claim::Acquired));
    }

    #[test]
    fn test_recorded_outcome_releases_staged_task() {
        let mut board = TaskBoard::default();
        let a = task(vec![]);
        let a_id = a.id;
        board.add(a).unwrap();
        assert_eq!(board.staged_count(), 1);

        board.record_outcome(Outcome::failed(a_id, None, Vec::new(), "done"));
        assert_eq!(board.staged_count(), 0);
        assert!(board.get(a_id).is_none());
        assert!(board.check_dependencies(&task(vec![a_id]), 8).unwrap().is_empty());
    }

    #[test]
    fn test_outcome_cache_evicts_oldest() {
        let mut board = TaskBoard::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            board.record_outcome(Outcome::failed(*id, None, Vec::new(), "done"));
        }
        assert_eq!(board.outcome_count(), 2);
        assert!(board.outcome(ids[0]).is_none());
        assert!(board.outcome(ids[2]).is_some());
        let order: Vec<Uuid> = board.outcomes().iter().map(|o| o.task_id).collect();
        assert_eq!(order, vec![ids[1], ids[2]]);
    }
}
