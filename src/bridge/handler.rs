use crate::record::{LogRecord, ProviderTag};
use crate::sender::{BatchingSender, DeliveryStatus, SendError};
use crate::session::BridgeSession;
use crate::source::{AckHandle, MessageHandler, PullError, ReceivedMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A progress line is logged every this many processed messages.
pub const PROGRESS_LOG_EVERY: u64 = 500;

/// Turns pulled messages into stream records and acks them once the stream
/// has accepted them.
pub struct ForwardingHandler {
    sender: BatchingSender,
    session: Arc<BridgeSession>,
    tag: ProviderTag,
    outcomes: TaskTracker,
}

impl ForwardingHandler {
    pub fn new(sender: BatchingSender, session: Arc<BridgeSession>, tag: ProviderTag) -> Self {
        Self {
            sender,
            session,
            tag,
            outcomes: TaskTracker::new(),
        }
    }

    /// Wait for every receipt handed out so far to be settled.
    ///
    /// Call after the subscription has stopped and the sender has flushed.
    pub async fn wait_for_outcomes(&self) {
        self.outcomes.close();
        self.outcomes.wait().await;
    }

    /// Receipts still waiting for the stream's answer.
    pub fn pending_outcomes(&self) -> usize {
        self.outcomes.len()
    }
}

fn settle(session: &BridgeSession, message_id: &str, ack: AckHandle, status: DeliveryStatus) {
    match status {
        DeliveryStatus::Accepted { partition, offset } => {
            debug!(message_id = %message_id, partition = %partition, offset, "Record accepted");
            ack.ack();
            session.record_sent();
        }
        DeliveryStatus::Failed { reason } => {
            // Not acked: the queue redelivers after the lease expires.
            debug!(message_id = %message_id, reason = %reason, "Record not delivered");
            drop(ack);
            session.record_failed();
        }
    }
}

fn is_first_delivery(message: &ReceivedMessage) -> bool {
    message.delivery_attempt.map_or(true, |attempt| attempt <= 1)
}

#[async_trait]
impl MessageHandler for ForwardingHandler {
    async fn on_message(&self, message: ReceivedMessage, ack: AckHandle) {
        if message.data.iter().all(u8::is_ascii_whitespace) {
            debug!(message_id = %message.message_id, "Skipping empty message");
            ack.ack();
            self.session.record_skipped();
            return;
        }

        let record = match LogRecord::decode(
            message.message_id.clone(),
            message.publish_time,
            &message.data,
            &self.tag,
        ) {
            Ok(record) => record,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Failed to decode message");
                self.session.record_error();
                ack.nack();
                return;
            }
        };

        let receipt = match self.sender.enqueue(record).await {
            Ok(receipt) => receipt,
            Err(e @ SendError::Oversized { .. }) => {
                warn!(message_id = %message.message_id, error = %e, "Record can never fit a batch");
                self.session.record_processed();
                self.session.record_failed();
                return;
            }
            Err(e @ SendError::Closed) => {
                debug!(message_id = %message.message_id, error = %e, "Sender closed, releasing message");
                self.session.record_error();
                ack.nack();
                return;
            }
        };

        // Redeliveries of records this bridge already failed must not keep a
        // drain run alive.
        if is_first_delivery(&message) {
            self.session.touch();
        }

        let processed = self.session.record_processed();
        if processed % PROGRESS_LOG_EVERY == 0 {
            let summary = self.session.summary();
            info!(
                processed,
                sent = summary.sent,
                failed = summary.failed,
                batches = summary.batches,
                "Forwarding progress"
            );
        }

        let session = Arc::clone(&self.session);
        let message_id = message.message_id;
        self.outcomes.spawn(async move {
            let status = receipt.await;
            settle(&session, &message_id, ack, status);
        });
    }

    fn on_error(&self, error: PullError) {
        self.session.signal_fatal(format!("source: {error}"));
    }
}
