use crate::source::{PullClient, PullError, ReceivedMessage};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pub/Sub accepts at most this many ack ids per request.
pub const MAX_ACK_IDS_PER_REQUEST: usize = 1000;

const ACK_SEND_ATTEMPTS: usize = 3;
const ACK_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Receives messages from a running subscription.
///
/// `on_message` may run concurrently with itself, up to
/// [`SubscriberSettings::max_concurrency`] invocations at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: ReceivedMessage, ack: AckHandle);

    /// Called once when pulling stops on an unrecoverable error.
    fn on_error(&self, error: PullError);
}

#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    /// Upper bound for a single pull request.
    pub max_messages: usize,
    /// Handler invocations allowed in flight; 1 serializes delivery.
    pub max_concurrency: usize,
    /// Lease applied to every pulled message, if set.
    pub ack_deadline_seconds: Option<u32>,
    /// Pause after a pull that returned nothing.
    pub empty_pull_backoff: Duration,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    /// How often buffered acks are sent.
    pub ack_flush_interval: Duration,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_concurrency: 100,
            ack_deadline_seconds: None,
            empty_pull_backoff: Duration::from_millis(500),
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(30),
            ack_flush_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
enum AckCommand {
    Ack(String),
    Nack(String),
}

/// Acknowledgment capability for one delivered message.
///
/// Dropping the handle without calling [`ack`](Self::ack) or
/// [`nack`](Self::nack) leaves the message to be redelivered when its lease
/// expires.
pub struct AckHandle {
    ack_id: String,
    tx: mpsc::UnboundedSender<AckCommand>,
}

impl AckHandle {
    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    /// Mark the message consumed; the queue will not redeliver it.
    pub fn ack(self) {
        if self.tx.send(AckCommand::Ack(self.ack_id)).is_err() {
            warn!("Ack dispatcher closed, message will be redelivered");
        }
    }

    /// Release the message for immediate redelivery.
    pub fn nack(self) {
        let _ = self.tx.send(AckCommand::Nack(self.ack_id));
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("ack_id", &self.ack_id)
            .finish()
    }
}

/// Streaming consumer on top of a [`PullClient`].
pub struct Subscriber {
    client: Arc<dyn PullClient>,
    settings: SubscriberSettings,
}

impl Subscriber {
    pub fn new(client: Arc<dyn PullClient>, settings: SubscriberSettings) -> Self {
        Self { client, settings }
    }

    pub fn subscription(&self) -> &str {
        self.client.subscription()
    }

    /// Begin pulling in the background, delivering every message to `handler`.
    pub fn start<H: MessageHandler>(&self, handler: Arc<H>) -> SubscriptionHandle {
        let cancel = CancellationToken::new();
        let handlers = TaskTracker::new();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let ack_task = tokio::spawn(run_ack_dispatcher(
            Arc::clone(&self.client),
            ack_rx,
            self.settings.ack_flush_interval,
        ));

        let pull_task = tokio::spawn(run_pull_loop(
            Arc::clone(&self.client),
            self.settings.clone(),
            handler,
            cancel.clone(),
            handlers.clone(),
            ack_tx.clone(),
        ));

        SubscriptionHandle {
            cancel,
            handlers,
            pull_task: Mutex::new(Some(pull_task)),
            ack_tx: Mutex::new(Some(ack_tx)),
            ack_task: Mutex::new(Some(ack_task)),
        }
    }
}

/// Control handle of a running subscription.
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    handlers: TaskTracker,
    pull_task: Mutex<Option<JoinHandle<()>>>,
    ack_tx: Mutex<Option<mpsc::UnboundedSender<AckCommand>>>,
    ack_task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHandle {
    /// Stop pulling and wait for in-flight handlers to return.
    ///
    /// Nothing is delivered after this returns. Acks issued later are still
    /// sent until [`finish`](Self::finish).
    pub async fn stop(&self) {
        self.cancel.cancel();

        let pull_task = self.pull_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = pull_task {
            if let Err(e) = task.await {
                error!(error = %e, "Pull task ended abnormally");
            }
        }

        self.handlers.close();
        self.handlers.wait().await;
    }

    /// Stop, then send every outstanding ack.
    ///
    /// Waits until all [`AckHandle`]s are consumed or dropped, or `timeout`
    /// elapses.
    pub async fn finish(&self, timeout: Duration) {
        self.stop().await;

        drop(self.ack_tx.lock().ok().and_then(|mut guard| guard.take()));
        let ack_task = self.ack_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = ack_task {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Ack dispatcher ended abnormally"),
                Err(_) => warn!(
                    timeout_secs = timeout.as_secs(),
                    "Timed out flushing acks, unacknowledged messages will be redelivered"
                ),
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run_pull_loop<H: MessageHandler>(
    client: Arc<dyn PullClient>,
    settings: SubscriberSettings,
    handler: Arc<H>,
    cancel: CancellationToken,
    handlers: TaskTracker,
    ack_tx: mpsc::UnboundedSender<AckCommand>,
) {
    let permits = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
    let mut backoff = settings.retry_initial_backoff;

    info!(
        subscription = %client.subscription(),
        max_concurrency = settings.max_concurrency,
        "Streaming pull started"
    );

    'pull: loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.pull(settings.max_messages) => result,
        };

        let messages = match result {
            Ok(messages) => {
                backoff = settings.retry_initial_backoff;
                messages
            }
            Err(e) if e.is_retriable() => {
                warn!(
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Pull failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = std::cmp::min(backoff * 2, settings.retry_max_backoff);
                continue;
            }
            Err(e) => {
                error!(error = %e, "Unrecoverable pull error, stopping subscription");
                handler.on_error(e);
                break;
            }
        };

        if messages.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.empty_pull_backoff) => {}
            }
            continue;
        }

        debug!(count = messages.len(), "Pulled messages");

        if let Some(seconds) = settings.ack_deadline_seconds {
            let ack_ids: Vec<String> = messages.iter().map(|m| m.ack_id.clone()).collect();
            if let Err(e) = client.modify_ack_deadline(&ack_ids, seconds).await {
                warn!(error = %e, "Failed to set ack deadline on pulled messages");
            }
        }

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                // Stopped before these could be delivered.
                let _ = ack_tx.send(AckCommand::Nack(message.ack_id));
                for rest in pending {
                    let _ = ack_tx.send(AckCommand::Nack(rest.ack_id));
                }
                break 'pull;
            };

            let ack = AckHandle {
                ack_id: message.ack_id.clone(),
                tx: ack_tx.clone(),
            };
            let handler = Arc::clone(&handler);
            handlers.spawn(async move {
                handler.on_message(message, ack).await;
                drop(permit);
            });
        }
    }

    debug!("Pull loop exited");
}

async fn run_ack_dispatcher(
    client: Arc<dyn PullClient>,
    mut rx: mpsc::UnboundedReceiver<AckCommand>,
    flush_interval: Duration,
) {
    let mut acks: Vec<String> = Vec::new();
    let mut nacks: Vec<String> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(AckCommand::Ack(id)) => {
                    acks.push(id);
                    if acks.len() >= MAX_ACK_IDS_PER_REQUEST {
                        send_acks(client.as_ref(), &mut acks).await;
                    }
                }
                Some(AckCommand::Nack(id)) => nacks.push(id),
                None => break,
            },
            _ = ticker.tick() => {
                send_acks(client.as_ref(), &mut acks).await;
                send_nacks(client.as_ref(), &mut nacks).await;
            }
        }
    }

    send_acks(client.as_ref(), &mut acks).await;
    send_nacks(client.as_ref(), &mut nacks).await;
    debug!("Ack dispatcher exited");
}

async fn send_acks(client: &dyn PullClient, ids: &mut Vec<String>) {
    for chunk in ids.chunks(MAX_ACK_IDS_PER_REQUEST) {
        let mut attempt = 0;
        let mut backoff = ACK_RETRY_BACKOFF;
        loop {
            attempt += 1;
            match client.acknowledge(chunk).await {
                Ok(()) => {
                    debug!(count = chunk.len(), "Acknowledged messages");
                    break;
                }
                Err(e) if e.is_retriable() && attempt < ACK_SEND_ATTEMPTS => {
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Acknowledge failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(
                        count = chunk.len(),
                        error = %e,
                        "Acknowledge failed, messages will be redelivered"
                    );
                    break;
                }
            }
        }
    }
    ids.clear();
}

async fn send_nacks(client: &dyn PullClient, ids: &mut Vec<String>) {
    for chunk in ids.chunks(MAX_ACK_IDS_PER_REQUEST) {
        if let Err(e) = client.modify_ack_deadline(chunk, 0).await {
            // The lease runs out on its own; this only delays redelivery.
            debug!(count = chunk.len(), error = %e, "Nack failed");
        }
    }
    ids.clear();
}
