use crate::catalog::CapabilityCatalog;
use crate::store::OutcomeLog;
use crate::types::{Outcome, OutcomeRecord};
use parking_lot::{Mutex, RwLock};
use quorum_core::ErrorKind;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

enum RecorderMessage {
    Record(Box<Outcome>),
    Flush(oneshot::Sender<()>),
}

/// Feeds completed outcomes back into the catalog's ranking signals.
///
/// Recording never blocks the caller: outcomes are queued to a background
/// writer that applies success-rate updates and appends to the outcome log.
/// Outcomes recorded before [`start`](Self::start) are held in the queue.
/// The queue is bounded; when it is full new outcomes are dropped with a warning.
pub struct OutcomeRecorder {
    tx: mpsc::Sender<RecorderMessage>,
    writer: Mutex<Option<RecorderWriter>>,
    started: AtomicBool,
    priors: RwLock<HashMap<String, String>>,
}

struct RecorderWriter {
    rx: mpsc::Receiver<RecorderMessage>,
    catalog: Arc<CapabilityCatalog>,
    log: Option<Arc<dyn OutcomeLog>>,
    alpha: f64,
}

impl OutcomeRecorder {
    /// A stopped recorder; `alpha` weights the newest observation.
    pub fn new(
        catalog: Arc<CapabilityCatalog>,
        log: Option<Arc<dyn OutcomeLog>>,
        alpha: f64,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            tx,
            writer: Mutex::new(Some(RecorderWriter {
                rx,
                catalog,
                log,
                alpha,
            })),
            started: AtomicBool::new(false),
            priors: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn the background writer. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(writer) = self.writer.lock().take() else {
            return;
        };
        self.started.store(true, Ordering::SeqCst);
        tokio::spawn(writer.run());
    }

    /// Whether the background writer has been spawned.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Queue an outcome for feedback. Fire-and-forget.
    pub fn record(&self, outcome: &Outcome) {
        match self
            .tx
            .try_send(RecorderMessage::Record(Box::new(outcome.clone())))
        {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(task_id = %outcome.task_id, "Outcome recorder queue is full, dropping outcome");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(task_id = %outcome.task_id, "Outcome recorder is gone, dropping outcome");
            }
        }
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        if !self.is_started() {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RecorderMessage::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Remember which strategy won for a problem signature.
    pub fn record_strategy_win(&self, signature: &str, strategy: &str) {
        debug!(signature = %signature, strategy = %strategy, "Recording strategy prior");
        self.priors
            .write()
            .insert(signature.to_string(), strategy.to_string());
    }

    /// The strategy that last won for a problem signature.
    pub fn strategy_prior(&self, signature: &str) -> Option<String> {
        self.priors.read().get(signature).cloned()
    }
}

impl RecorderWriter {
    async fn run(mut self) {
        info!("Outcome recorder started");
        while let Some(message) = self.rx.recv().await {
            match message {
                RecorderMessage::Record(outcome) => self.apply(&outcome).await,
                RecorderMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Outcome recorder stopped");
    }

    async fn apply(&self, outcome: &Outcome) {
        let mut touched = BTreeSet::new();
        for attempt in &outcome.attempts {
            if matches!(
                attempt.error_kind,
                Some(ErrorKind::Resource | ErrorKind::Cancelled)
            ) {
                continue;
            }
            let Some(capability) = &attempt.capability else {
                continue;
            };
            if let Some(rate) = self.catalog.update_success_rate(
                &attempt.worker_id,
                capability,
                attempt.success,
                self.alpha,
            ) {
                debug!(
                    worker_id = %attempt.worker_id,
                    capability = %capability,
                    success_rate = rate,
                    "Updated success rate"
                );
                touched.insert(attempt.worker_id.clone());
            }
        }

        for worker_id in &touched {
            if let Err(e) = self.catalog.persist(worker_id).await {
                error!(worker_id = %worker_id, error = %e, "Failed to persist learned success rate");
            }
        }

        if let Some(log) = &self.log {
            if let Err(e) = log.append(&OutcomeRecord::from(outcome)).await {
                error!(task_id = %outcome.task_id, error = %e, "Failed to append outcome record");
            }
        }
    }
}
