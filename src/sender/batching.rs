use crate::record::LogRecord;
use crate::sender::batch::{Batch, BatchLimits, DeliveryStatus, PendingRecord, Receipt};
use crate::session::BridgeSession;
use crate::sink::{EntryResult, PutMessagesEntry, SinkError, StreamSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("sender is shut down")]
    Closed,

    #[error("record of {size} bytes exceeds the batch limit of {limit} bytes")]
    Oversized { size: usize, limit: usize },
}

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub limits: BatchLimits,
    /// A non-empty buffer is submitted at least this often. `None` disables.
    pub flush_interval: Option<Duration>,
    /// Attempts per batch, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Batches allowed to wait for submission before `enqueue` blocks.
    pub max_pending_batches: usize,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            limits: BatchLimits::default(),
            flush_interval: Some(Duration::from_secs(5)),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_pending_batches: 4,
        }
    }
}

enum SubmitCommand {
    Batch(Batch),
    Flush(oneshot::Sender<()>),
}

struct BufferState {
    batch: Batch,
    // Taken on shutdown; `None` means closed.
    tx: Option<mpsc::Sender<SubmitCommand>>,
}

struct Inner {
    limits: BatchLimits,
    state: tokio::sync::Mutex<BufferState>,
    flush_calls: AtomicU64,
    linger_cancel: CancellationToken,
    submit_task: Mutex<Option<JoinHandle<()>>>,
    linger_task: Mutex<Option<JoinHandle<()>>>,
}

/// Buffers records into bounded batches and submits them to a [`StreamSink`].
///
/// The buffer is guarded by one mutex: append, the bound check and the swap
/// to a fresh batch happen together, so a record lands in exactly one batch.
/// Full batches go through a bounded queue to a single submitter task, which
/// keeps submissions strictly one at a time while the next batch fills.
#[derive(Clone)]
pub struct BatchingSender {
    inner: Arc<Inner>,
}

impl BatchingSender {
    pub fn new(
        sink: Arc<dyn StreamSink>,
        settings: SenderSettings,
        session: Arc<BridgeSession>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.max_pending_batches.max(1));

        let submitter = Submitter {
            sink,
            session,
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            destination_refused: false,
        };
        let submit_task = tokio::spawn(submitter.run(rx));

        let inner = Arc::new(Inner {
            limits: settings.limits,
            state: tokio::sync::Mutex::new(BufferState {
                batch: Batch::new(),
                tx: Some(tx),
            }),
            flush_calls: AtomicU64::new(0),
            linger_cancel: CancellationToken::new(),
            submit_task: Mutex::new(Some(submit_task)),
            linger_task: Mutex::new(None),
        });

        if let Some(interval) = settings.flush_interval {
            let task = tokio::spawn(run_linger(
                Arc::downgrade(&inner),
                interval,
                inner.linger_cancel.clone(),
            ));
            if let Ok(mut guard) = inner.linger_task.lock() {
                *guard = Some(task);
            }
        }

        Self { inner }
    }

    pub fn limits(&self) -> BatchLimits {
        self.inner.limits
    }

    /// Append `record` to the current batch.
    ///
    /// If the record does not fit, the current batch is queued for submission
    /// first and the record opens the next one. Only blocks while
    /// `max_pending_batches` batches are already waiting.
    pub async fn enqueue(&self, record: LogRecord) -> Result<Receipt, SendError> {
        let (pending, receipt) = PendingRecord::new(record);
        let limits = self.inner.limits;
        if pending.estimated_bytes > limits.max_bytes {
            return Err(SendError::Oversized {
                size: pending.estimated_bytes,
                limit: limits.max_bytes,
            });
        }

        let mut state = self.inner.state.lock().await;
        let BufferState { batch, tx } = &mut *state;
        let tx = tx.as_ref().ok_or(SendError::Closed)?;

        if batch.would_overflow(pending.estimated_bytes, &limits) {
            queue_batch(tx, batch.take()).await?;
        }
        batch.push(pending);
        if batch.is_full(&limits) {
            queue_batch(tx, batch.take()).await?;
        }

        Ok(receipt)
    }

    /// Submit whatever is buffered and wait for every queued batch to finish.
    ///
    /// Safe to call at any time, including after [`shutdown`](Self::shutdown).
    pub async fn flush(&self) {
        self.inner.flush_calls.fetch_add(1, Ordering::Relaxed);

        let done = {
            let mut state = self.inner.state.lock().await;
            let BufferState { batch, tx } = &mut *state;
            let Some(tx) = tx.as_ref() else {
                return;
            };
            if !batch.is_empty() && queue_batch(tx, batch.take()).await.is_err() {
                return;
            }
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(SubmitCommand::Flush(done_tx)).await.is_err() {
                return;
            }
            done_rx
        };

        let _ = done.await;
    }

    /// Submit the remaining buffer, then stop the background tasks.
    ///
    /// Every receipt handed out has resolved by the time this returns.
    pub async fn shutdown(&self) {
        self.inner.linger_cancel.cancel();
        let linger = self.inner.linger_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = linger {
            let _ = task.await;
        }

        {
            let mut state = self.inner.state.lock().await;
            if let Some(tx) = state.tx.take() {
                if !state.batch.is_empty() {
                    let _ = queue_batch(&tx, state.batch.take()).await;
                }
            }
        }

        let submitter = self.inner.submit_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = submitter {
            if let Err(e) = task.await {
                error!(error = %e, "Batch submitter ended abnormally");
            }
        }
    }

    /// Number of explicit [`flush`](Self::flush) calls so far.
    pub fn flush_calls(&self) -> u64 {
        self.inner.flush_calls.load(Ordering::Relaxed)
    }

    /// Records waiting in the current, not yet queued batch.
    pub async fn buffered(&self) -> usize {
        self.inner.state.lock().await.batch.len()
    }
}

async fn queue_batch(tx: &mpsc::Sender<SubmitCommand>, batch: Batch) -> Result<(), SendError> {
    // On failure the batch is dropped, which resolves its receipts as failed.
    tx.send(SubmitCommand::Batch(batch))
        .await
        .map_err(|_| SendError::Closed)
}

async fn run_linger(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut state = inner.state.lock().await;
        let BufferState { batch, tx } = &mut *state;
        let Some(tx) = tx.as_ref() else {
            break;
        };
        if batch.is_empty() {
            continue;
        }

        debug!(
            batch_id = %batch.id,
            records = batch.len(),
            age_ms = batch.age().as_millis() as u64,
            "Flushing batch on interval"
        );
        if queue_batch(tx, batch.take()).await.is_err() {
            break;
        }
    }
}

struct Submitter {
    sink: Arc<dyn StreamSink>,
    session: Arc<BridgeSession>,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    // Set once the stream answers 401/403/404; later batches are not sent.
    destination_refused: bool,
}

impl Submitter {
    async fn run(mut self, mut rx: mpsc::Receiver<SubmitCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                SubmitCommand::Batch(batch) => self.submit(batch).await,
                SubmitCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Batch submitter exited");
    }

    async fn submit(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let Batch { id, records, .. } = batch;
        let count = records.len();

        if self.destination_refused {
            debug!(batch_id = %id, records = count, "Skipping submission, destination refused earlier requests");
            for pending in records {
                pending.resolve(DeliveryStatus::Failed {
                    reason: "destination refused an earlier request".to_string(),
                });
            }
            return;
        }

        let entries: Vec<PutMessagesEntry> = records.iter().map(PendingRecord::to_entry).collect();
        match self.put_with_retry(id, &entries).await {
            Ok(results) => {
                let batches = self.session.record_batch();
                if results.len() != count {
                    warn!(
                        batch_id = %id,
                        expected = count,
                        received = results.len(),
                        "PutMessages returned a mismatched number of entries"
                    );
                }

                let mut results = results.into_iter();
                let (mut sent, mut failed) = (0usize, 0usize);
                for pending in records {
                    let status = match results.next() {
                        Some(EntryResult::Accepted { partition, offset }) => {
                            sent += 1;
                            DeliveryStatus::Accepted { partition, offset }
                        }
                        Some(EntryResult::Rejected { error, message }) => {
                            failed += 1;
                            debug!(
                                batch_id = %id,
                                message_id = %pending.record.id(),
                                error = %error,
                                "Stream rejected record"
                            );
                            DeliveryStatus::Failed {
                                reason: format!("{error}: {message}"),
                            }
                        }
                        None => {
                            failed += 1;
                            DeliveryStatus::Failed {
                                reason: "no result entry returned for record".to_string(),
                            }
                        }
                    };
                    pending.resolve(status);
                }

                if sent > 0 {
                    self.session.touch();
                }
                info!(batch_id = %id, sent, failed, batches, "Flushed batch to stream");
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(batch_id = %id, error = %e, "Destination refused the request, stopping");
                    self.destination_refused = true;
                    self.session.signal_fatal(format!("destination: {e}"));
                } else {
                    warn!(
                        batch_id = %id,
                        records = count,
                        error = %e,
                        "Batch submission failed, records left unacknowledged"
                    );
                }

                let reason = e.to_string();
                for pending in records {
                    pending.resolve(DeliveryStatus::Failed {
                        reason: reason.clone(),
                    });
                }
            }
        }
    }

    /// Retry a whole-batch submission with exponential backoff.
    async fn put_with_retry(
        &self,
        batch_id: Uuid,
        entries: &[PutMessagesEntry],
    ) -> Result<Vec<EntryResult>, SinkError> {
        let mut attempts = 0;
        let mut backoff = self.initial_backoff;

        loop {
            attempts += 1;
            match self.sink.put_messages(entries).await {
                Ok(results) => return Ok(results),
                Err(e) if e.is_retriable() && attempts < self.max_attempts => {
                    warn!(
                        batch_id = %batch_id,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "PutMessages failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
                Err(e) => {
                    if attempts > 1 {
                        error!(batch_id = %batch_id, attempts, error = %e, "Max retries exceeded");
                    }
                    return Err(e);
                }
            }
        }
    }
}
