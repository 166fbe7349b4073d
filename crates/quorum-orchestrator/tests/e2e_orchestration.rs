//! End-to-end orchestration tests.
//!
//! Drives the public `Orchestrator` API with mock workers: pattern selection,
//! arbitration across concurrent attempts, health gating, load limits,
//! persistence round-trips, cancellation and shutdown draining.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use quorum_core::{ErrorKind, QuorumError, QuorumResult};
use quorum_orchestrator::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Mock worker
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Script {
    Succeed(f64),
    Fail(&'static str),
}

struct MockWorker {
    descriptor: WorkerDescriptor,
    script: Script,
    delay: Duration,
    healthy: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockWorker {
    fn new(id: &str, capability: &str, priority: u32) -> Self {
        Self {
            descriptor: WorkerDescriptor::new(id, id, "mock")
                .with_capability(Capability::new(capability, 0.8))
                .with_priority(priority),
            script: Script::Succeed(0.8),
            delay: Duration::ZERO,
            healthy: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn confidence(mut self, confidence: f64) -> Self {
        self.script = Script::Succeed(confidence);
        self
    }

    fn fail(mut self, message: &'static str) -> Self {
        self.script = Script::Fail(message);
        self
    }

    fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    fn max_concurrent(mut self, max: usize) -> Self {
        self.descriptor.resources.max_concurrent_tasks = max;
        self
    }

    fn log_to(mut self, calls: &Arc<Mutex<Vec<String>>>) -> Self {
        self.calls = calls.clone();
        self
    }
}

#[async_trait]
impl Worker for MockWorker {
    fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    async fn health_check(&self) -> HealthReport {
        if self.healthy.load(Ordering::SeqCst) {
            HealthReport::healthy()
        } else {
            HealthReport::unhealthy(vec!["health check refused".into()])
        }
    }

    async fn execute(&self, task: &Task) -> QuorumResult<WorkerReport> {
        self.calls.lock().push(self.descriptor.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed(confidence) => Ok(WorkerReport::success(
                serde_json::json!({ "by": self.descriptor.id, "input": task.payload }),
                *confidence,
            )),
            Script::Fail(message) => Ok(WorkerReport::failure(*message)),
        }
    }
}

/// Rebuilds every persisted descriptor as a succeeding mock.
struct MockFactory;

impl WorkerFactory for MockFactory {
    fn build(&self, descriptor: &WorkerDescriptor) -> Option<Arc<dyn Worker>> {
        (descriptor.kind == "mock").then(|| {
            let mut worker = MockWorker::new(&descriptor.id, "unused", 0);
            worker.descriptor = descriptor.clone();
            Arc::new(worker) as Arc<dyn Worker>
        })
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        default_timeout_ms: 1_000,
        health_check_interval_ms: 0,
        drain_timeout_ms: 500,
        shutdown_timeout_ms: 1_000,
        ..EngineConfig::default()
    }
}

async fn engine_with(workers: Vec<MockWorker>) -> Orchestrator {
    let engine = Orchestrator::new(test_config()).unwrap();
    for worker in workers {
        engine.register_worker(Arc::new(worker)).await.unwrap();
    }
    engine.start().await.unwrap();
    engine
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_sequential_prefers_higher_priority() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine = engine_with(vec![
        MockWorker::new("w1", "login", 5).max_concurrent(2).log_to(&calls),
        MockWorker::new("w2", "login", 3).log_to(&calls),
    ])
    .await;

    let outcome = engine
        .submit_task(Task::new("login-click", serde_json::json!({"selector": "#go"})))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.pattern, Some(OrchestrationPattern::Sequential));
    assert_eq!(outcome.winner_id(), Some("w1"));
    assert_eq!(*calls.lock(), vec!["w1".to_string()]);
}

#[tokio::test]
async fn scenario_b_concurrent_picks_highest_confidence() {
    let engine = engine_with(vec![
        MockWorker::new("a", "search", 5).confidence(0.4),
        MockWorker::new("b", "search", 5).confidence(0.9),
        MockWorker::new("c", "search", 5).confidence(0.7),
    ])
    .await;

    let outcome = engine
        .submit_task(Task::new("search", serde_json::Value::Null).with_priority(9))
        .await
        .unwrap();

    assert_eq!(outcome.pattern, Some(OrchestrationPattern::Concurrent));
    assert!((outcome.confidence - 0.9).abs() < 1e-9);
    let alternatives: Vec<f64> = outcome.alternatives.iter().map(|r| r.confidence).collect();
    assert_eq!(alternatives, vec![0.7, 0.4]);
    assert_eq!(outcome.attempts.len(), 3);
}

#[tokio::test]
async fn scenario_c_unhealthy_worker_skipped() {
    let flaky = MockWorker::new("flaky", "checkout", 9);
    let flaky_health = flaky.healthy.clone();
    let flaky_calls = flaky.calls.clone();
    let engine = engine_with(vec![flaky, MockWorker::new("steady", "checkout", 1)]).await;
    flaky_health.store(false, Ordering::SeqCst);

    let outcome = engine
        .submit_task(Task::new("checkout", serde_json::Value::Null))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.winner_id(), Some("steady"));
    assert_eq!(outcome.attempts[0].worker_id, "flaky");
    assert!(!outcome.attempts[0].success);
    assert_eq!(outcome.attempts[0].error_kind, Some(ErrorKind::Health));
    assert!(flaky_calls.lock().is_empty());
}

#[tokio::test]
async fn scenario_d_all_concurrent_attempts_fail() {
    let engine = engine_with(vec![
        MockWorker::new("a", "scrape", 5).fail("blocked").delay_ms(10),
        MockWorker::new("b", "scrape", 5).fail("captcha").delay_ms(40),
        MockWorker::new("c", "scrape", 5).fail("404").delay_ms(20),
    ])
    .await;

    let outcome = engine
        .submit_task(
            Task::new("scrape", serde_json::Value::Null)
                .with_pattern(OrchestrationPattern::Concurrent),
        )
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.winner.is_none());
    assert_eq!(outcome.errors.len(), 3);
    let messages: Vec<&str> = outcome.errors.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["blocked", "captcha", "404"]);
    assert!(outcome.elapsed_ms >= 40);
    assert!(outcome.elapsed_ms <= outcome.wall_time_ms);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_never_attempts_after_success() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine = engine_with(vec![
        MockWorker::new("first", "pay", 9).fail("declined").log_to(&calls),
        MockWorker::new("second", "pay", 5).log_to(&calls),
        MockWorker::new("third", "pay", 1).log_to(&calls),
    ])
    .await;

    let outcome = engine
        .submit_task(Task::new("pay", serde_json::Value::Null))
        .await
        .unwrap();
    assert_eq!(outcome.winner_id(), Some("second"));
    assert_eq!(*calls.lock(), vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn concurrent_outcome_independent_of_registration_order() {
    let confidences = [("x", 0.55), ("y", 0.85), ("z", 0.75)];
    let mut verdicts = Vec::new();
    for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
        let workers = order
            .iter()
            .map(|&i| {
                let (id, confidence) = confidences[i];
                MockWorker::new(id, "rank", 5).confidence(confidence)
            })
            .collect();
        let engine = engine_with(workers).await;
        let outcome = engine
            .submit_task(
                Task::new("rank", serde_json::Value::Null)
                    .with_pattern(OrchestrationPattern::Concurrent),
            )
            .await
            .unwrap();
        verdicts.push((outcome.winner_id().map(str::to_string), outcome.confidence));
    }
    assert!(verdicts.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(verdicts[0].0.as_deref(), Some("y"));
}

#[tokio::test]
async fn load_never_exceeds_max_concurrent() {
    let worker = MockWorker::new("only", "render", 5)
        .max_concurrent(2)
        .delay_ms(50);
    let peak = worker.peak.clone();
    let engine = engine_with(vec![worker]).await;

    let outcomes = join_all((0..6).map(|_| {
        engine.submit_task(Task::new("render", serde_json::Value::Null))
    }))
    .await;

    let outcomes: Vec<Outcome> = outcomes.into_iter().map(Result::unwrap).collect();
    assert!(peak.load(Ordering::SeqCst) <= 2);
    let rejected = outcomes
        .iter()
        .filter(|o| o.attempts.iter().any(|a| a.error_kind == Some(ErrorKind::Resource)))
        .count();
    assert_eq!(outcomes.iter().filter(|o| o.success).count() + rejected, 6);
    assert!(rejected >= 4);
    assert_eq!(engine.catalog().load("only"), 0);
}

#[tokio::test]
async fn deregister_unknown_worker_is_noop() {
    let engine = engine_with(vec![MockWorker::new("w1", "login", 5)]).await;
    assert!(!engine.deregister_worker("ghost").await.unwrap());
    assert!(engine.deregister_worker("w1").await.unwrap());
    assert!(!engine.deregister_worker("w1").await.unwrap());
    assert!(engine.catalog().is_empty());
}

#[tokio::test]
async fn persisted_capabilities_reproduce_ranking() {
    let dir = tempfile::tempdir().unwrap();
    let ranking_before: Vec<String> = {
        let persistence = Persistence::file_backed(dir.path(), Some(Arc::new(MockFactory)))
            .await
            .unwrap();
        let engine = Orchestrator::with_persistence(test_config(), persistence).unwrap();
        engine
            .register_worker(Arc::new(MockWorker::new("alpha", "fetch", 5).fail("dns")))
            .await
            .unwrap();
        engine
            .register_worker(Arc::new(MockWorker::new("beta", "fetch", 5)))
            .await
            .unwrap();
        engine.start().await.unwrap();

        let outcome = engine
            .submit_task(Task::new("fetch", serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(outcome.winner_id(), Some("beta"));
        engine.stop().await.unwrap();

        engine
            .catalog()
            .find_candidates("fetch")
            .unwrap()
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    };
    assert_eq!(ranking_before, vec!["beta".to_string(), "alpha".to_string()]);

    let persistence = Persistence::file_backed(dir.path(), Some(Arc::new(MockFactory)))
        .await
        .unwrap();
    let restored = Orchestrator::with_persistence(test_config(), persistence).unwrap();
    restored.start().await.unwrap();
    let ranking_after: Vec<String> = restored
        .catalog()
        .find_candidates("fetch")
        .unwrap()
        .iter()
        .map(|c| c.id().to_string())
        .collect();
    assert_eq!(ranking_after, ranking_before);
    let alpha = restored.catalog().descriptor("alpha").unwrap();
    assert!((alpha.capabilities[0].success_rate - 0.8).abs() < 1e-9);

    let log = JsonlOutcomeLog::new(dir.path().join("outcomes.jsonl")).await.unwrap();
    let records = log.read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].worker_id.as_deref(), Some("beta"));
}

// ---------------------------------------------------------------------------
// Behaviours
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependency_cycle_rejected_before_dispatch() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine = engine_with(vec![MockWorker::new("w", "step", 5).log_to(&calls)]).await;

    let mut first = Task::new("step", serde_json::Value::Null);
    let second = Task::new("step", serde_json::Value::Null).with_dependencies(vec![first.id]);
    first.dependencies.push(second.id);
    engine.stage_task(first.clone()).unwrap();
    engine.stage_task(second).unwrap();

    let err = engine
        .submit_task(Task::new("step", serde_json::Value::Null).with_dependencies(vec![first.id]))
        .await
        .unwrap_err();
    assert!(matches!(err, QuorumError::DependencyCycle(_)));
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn pipeline_chains_stages() {
    let engine = engine_with(vec![
        MockWorker::new("extractor", "extract", 5),
        MockWorker::new("summarizer", "summarize", 5),
    ])
    .await;

    let outcome = engine
        .submit_task(
            Task::new("document-pipeline", serde_json::json!("pdf bytes"))
                .with_pattern(OrchestrationPattern::Pipeline)
                .with_pipeline_stages(vec!["extract".into(), "summarize".into()]),
        )
        .await;
    // The task type itself must still resolve to at least one worker.
    assert!(matches!(outcome, Err(QuorumError::NoCapableWorker(_))));

    let outcome = engine
        .submit_task(
            Task::new("extract", serde_json::json!("pdf bytes"))
                .with_pattern(OrchestrationPattern::Pipeline)
                .with_pipeline_stages(vec!["extract".into(), "summarize".into()]),
        )
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.winner_id(), Some("summarizer"));
    let payload = &outcome.winner.as_ref().unwrap().payload;
    assert_eq!(payload["input"]["by"], "extractor");
    assert_eq!(payload["input"]["input"], "pdf bytes");
}

#[tokio::test]
async fn scatter_gather_with_custom_aggregator() {
    struct Average;

    impl Aggregator for Average {
        fn aggregate(&self, _task: &Task, successes: &[AttemptResult]) -> QuorumResult<serde_json::Value> {
            let mean = successes.iter().map(|r| r.confidence).sum::<f64>() / successes.len() as f64;
            Ok(serde_json::json!({ "mean_confidence": mean }))
        }
    }

    let engine = engine_with(vec![
        MockWorker::new("a", "estimate", 5).confidence(0.6),
        MockWorker::new("b", "estimate", 5).confidence(0.8),
    ])
    .await;
    engine.register_aggregator("average", Arc::new(Average));

    let outcome = engine
        .submit_task(
            Task::new("estimate", serde_json::Value::Null)
                .with_pattern(OrchestrationPattern::ScatterGather)
                .with_aggregation("average"),
        )
        .await
        .unwrap();

    assert!(outcome.success);
    let winner = outcome.winner.as_ref().unwrap();
    assert_eq!(winner.worker_id, "aggregate:average");
    assert!((winner.payload["mean_confidence"].as_f64().unwrap() - 0.7).abs() < 1e-9);
    assert!((outcome.confidence - 0.88).abs() < 1e-9);
}

#[tokio::test]
async fn cancellation_fails_outcome() {
    let engine = engine_with(vec![MockWorker::new("slow", "crawl", 5).delay_ms(300)]).await;
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let outcome = engine
        .submit_task_with_cancel(Task::new("crawl", serde_json::Value::Null), cancel)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn stop_drains_in_flight_work() {
    let engine = Arc::new(engine_with(vec![MockWorker::new("w", "encode", 5).delay_ms(100)]).await);

    let submitter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .submit_task(Task::new("encode", serde_json::Value::Null))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.catalog().total_load(), 1);

    engine.stop().await.unwrap();
    assert_eq!(engine.catalog().total_load(), 0);
    assert_eq!(engine.state(), EngineState::Stopped);

    let outcome = submitter.await.unwrap().unwrap();
    assert!(outcome.success);
}

#[tokio::test]
async fn concurrent_dependents_share_one_dependency_run() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine = engine_with(vec![
        MockWorker::new("fetcher", "fetch", 5).delay_ms(50).log_to(&calls),
        MockWorker::new("parser", "parse", 5),
    ])
    .await;

    let fetch = Task::new("fetch", serde_json::Value::Null);
    let fetch_id = fetch.id;
    engine.stage_task(fetch).unwrap();

    let (left, right) = tokio::join!(
        engine.submit_task(Task::new("parse", serde_json::Value::Null).with_dependencies(vec![fetch_id])),
        engine.submit_task(Task::new("parse", serde_json::Value::Null).with_dependencies(vec![fetch_id])),
    );
    assert!(left.unwrap().success);
    assert!(right.unwrap().success);
    assert_eq!(*calls.lock(), vec!["fetcher".to_string()]);
    assert!(engine.outcome(fetch_id).unwrap().success);
}

#[tokio::test]
async fn stop_halts_pending_retries() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut config = test_config();
    config.retry.backoff_base_ms = 300;
    config.retry.backoff_max_ms = 300;
    let engine = Orchestrator::new(config).unwrap();
    engine
        .register_worker(Arc::new(MockWorker::new("flaky", "sync", 5).fail("boom").log_to(&calls)))
        .await
        .unwrap();
    engine.start().await.unwrap();
    let engine = Arc::new(engine);

    let submitter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .submit_task(
                    Task::new("sync", serde_json::Value::Null)
                        .with_pattern(OrchestrationPattern::Sequential)
                        .with_max_retries(3),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = std::time::Instant::now();
    engine.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(calls.lock().len(), 1);

    let outcome = submitter.await.unwrap().unwrap();
    assert!(!outcome.success);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test]
async fn submit_rejected_after_stop() {
    let engine = engine_with(vec![MockWorker::new("w", "encode", 5)]).await;
    engine.stop().await.unwrap();
    let err = engine
        .submit_task(Task::new("encode", serde_json::Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, QuorumError::Lifecycle(_)));
}

#[tokio::test]
async fn strategies_compete_and_priors_stick() {
    struct Guess {
        name: &'static str,
        confidence: f64,
    }

    #[async_trait]
    impl Strategy for Guess {
        fn name(&self) -> &str {
            self.name
        }

        async fn solve(&self, problem: &Problem) -> QuorumResult<StrategyAnswer> {
            Ok(StrategyAnswer {
                payload: serde_json::json!({ "answer": self.name, "for": problem.kind }),
                confidence: self.confidence,
            })
        }
    }

    let engine = engine_with(Vec::new()).await;
    let problem = Problem::new("locate-button", serde_json::json!({"text": "Buy"}));

    let first = engine
        .strategy_arbiter()
        .with_strategy(Arc::new(Guess { name: "css", confidence: 0.7 }))
        .with_strategy(Arc::new(Guess { name: "xpath", confidence: 0.5 }))
        .solve(&problem)
        .await
        .unwrap();
    assert_eq!(first.winner_id(), Some("css"));
    assert_eq!(
        engine.recorder().strategy_prior(&problem.signature()).as_deref(),
        Some("css")
    );

    let tied = engine
        .strategy_arbiter()
        .with_strategy(Arc::new(Guess { name: "aaa", confidence: 0.6 }))
        .with_strategy(Arc::new(Guess { name: "css", confidence: 0.6 }))
        .solve(&problem)
        .await
        .unwrap();
    assert_eq!(tied.winner_id(), Some("css"));
}

#[tokio::test]
async fn event_subscribers_see_status_changes() {
    let engine = engine_with(vec![MockWorker::new("w", "login", 5)]).await;
    let mut rx = engine.subscribe().unwrap();

    engine
        .set_worker_status("w", WorkerStatus::Maintenance)
        .unwrap();
    let err = engine
        .submit_task(Task::new("login", serde_json::Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoCapableWorker);

    let event = rx.recv().await.unwrap();
    assert_eq!(
        event,
        EngineEvent::WorkerStatusChanged {
            worker_id: "w".into(),
            from: WorkerStatus::Ready,
            to: WorkerStatus::Maintenance,
        }
    );
}
