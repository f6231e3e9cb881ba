use crate::record::LogRecord;
use crate::sink::PutMessagesEntry;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Fixed per-message overhead of the PutMessages envelope.
pub const ENTRY_OVERHEAD_BYTES: usize = 50;

/// Estimated wire size of one record: base64 body plus envelope.
pub fn estimate_entry_bytes(body_len: usize) -> usize {
    body_len.div_ceil(3) * 4 + ENTRY_OVERHEAD_BYTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 100,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Final outcome of one enqueued record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Accepted { partition: String, offset: i64 },
    Failed { reason: String },
}

impl DeliveryStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryStatus::Accepted { .. })
    }
}

/// Resolves once the batch holding the record has been submitted.
///
/// A receipt whose record is lost without an answer resolves to
/// [`DeliveryStatus::Failed`].
#[derive(Debug)]
pub struct Receipt(oneshot::Receiver<DeliveryStatus>);

impl Future for Receipt {
    type Output = DeliveryStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            result.unwrap_or_else(|_| DeliveryStatus::Failed {
                reason: "sender shut down before the record was submitted".to_string(),
            })
        })
    }
}

#[derive(Debug)]
pub(crate) struct PendingRecord {
    pub(crate) record: LogRecord,
    pub(crate) estimated_bytes: usize,
    pub(crate) reply: oneshot::Sender<DeliveryStatus>,
}

impl PendingRecord {
    pub(crate) fn new(record: LogRecord) -> (Self, Receipt) {
        let (reply, rx) = oneshot::channel();
        let estimated_bytes = estimate_entry_bytes(record.body().len());
        (
            Self {
                record,
                estimated_bytes,
                reply,
            },
            Receipt(rx),
        )
    }

    pub(crate) fn to_entry(&self) -> PutMessagesEntry {
        PutMessagesEntry {
            key: Some(self.record.id().as_bytes().to_vec()),
            value: self.record.body().to_vec(),
        }
    }

    pub(crate) fn resolve(self, status: DeliveryStatus) {
        // The caller may have stopped listening; nothing to do then.
        let _ = self.reply.send(status);
    }
}

/// Records collected for one PutMessages call.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) id: Uuid,
    pub(crate) records: Vec<PendingRecord>,
    bytes: usize,
    opened_at: Instant,
}

impl Batch {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            records: Vec::new(),
            bytes: 0,
            opened_at: Instant::now(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn estimated_bytes(&self) -> usize {
        self.bytes
    }

    /// Whether adding `bytes` more would break either limit.
    pub(crate) fn would_overflow(&self, bytes: usize, limits: &BatchLimits) -> bool {
        !self.is_empty()
            && (self.len() + 1 > limits.max_records || self.bytes + bytes > limits.max_bytes)
    }

    pub(crate) fn is_full(&self, limits: &BatchLimits) -> bool {
        self.len() >= limits.max_records
    }

    pub(crate) fn push(&mut self, pending: PendingRecord) {
        if self.is_empty() {
            self.opened_at = Instant::now();
        }
        self.bytes += pending.estimated_bytes;
        self.records.push(pending);
    }

    /// Swap in an empty batch and return the current one.
    pub(crate) fn take(&mut self) -> Batch {
        std::mem::replace(self, Batch::new())
    }

    pub(crate) fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }
}
