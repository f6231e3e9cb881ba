//! In-process fakes of both bridge seams: a leasing queue that redelivers
//! like Pub/Sub, and a stream that records what it was sent.

#![allow(dead_code)]

use async_trait::async_trait;
use pubsub2oci::sink::{EntryResult, PutMessagesEntry, SinkError, StreamSink};
use pubsub2oci::source::{PullClient, PullError, ReceivedMessage};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

// ===== Queue =====

struct QueuedMessage {
    id: String,
    data: Vec<u8>,
    leased_until: Option<Instant>,
    acked: bool,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    messages: Vec<QueuedMessage>,
    // ack id -> message index
    leases: HashMap<String, usize>,
    next_ack: u64,
    pull_errors: VecDeque<PullError>,
}

/// Pull queue with at-least-once delivery.
///
/// A pulled message is leased for `lease`; unless it is acked before the
/// lease runs out it becomes pullable again.
pub struct FakeQueue {
    state: Mutex<QueueState>,
    lease: Duration,
    pulls: AtomicUsize,
}

impl FakeQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            lease,
            pulls: AtomicUsize::new(0),
        }
    }

    /// Publish raw bytes; returns the message id (`msg-1`, `msg-2`, ...).
    pub fn publish_raw(&self, data: impl Into<Vec<u8>>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("msg-{}", state.messages.len() + 1);
        state.messages.push(QueuedMessage {
            id: id.clone(),
            data: data.into(),
            leased_until: None,
            acked: false,
            deliveries: 0,
        });
        id
    }

    pub fn publish_json(&self, value: &Value) -> String {
        self.publish_raw(serde_json::to_vec(value).unwrap())
    }

    pub fn fail_next_pull(&self, error: PullError) {
        self.state.lock().unwrap().pull_errors.push_back(error);
    }

    pub fn acked_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .filter(|m| m.acked)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn unacked_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .filter(|m| !m.acked)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn deliveries(&self, id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.deliveries)
            .unwrap_or(0)
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PullClient for FakeQueue {
    fn subscription(&self) -> &str {
        "projects/test-project/subscriptions/fake"
    }

    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, PullError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.pull_errors.pop_front() {
            return Err(error);
        }

        let QueueState {
            messages,
            leases,
            next_ack,
            ..
        } = &mut *state;

        let mut out = Vec::new();
        for (index, message) in messages.iter_mut().enumerate() {
            if out.len() >= max_messages {
                break;
            }
            if message.acked || message.leased_until.is_some_and(|until| until > now) {
                continue;
            }

            *next_ack += 1;
            let ack_id = format!("ack-{}", next_ack);
            leases.insert(ack_id.clone(), index);
            message.leased_until = Some(now + self.lease);
            message.deliveries += 1;

            out.push(ReceivedMessage {
                ack_id,
                message_id: message.id.clone(),
                data: message.data.clone(),
                publish_time: None,
                attributes: HashMap::new(),
                delivery_attempt: Some(message.deliveries),
            });
        }

        Ok(out)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), PullError> {
        let mut state = self.state.lock().unwrap();
        for ack_id in ack_ids {
            if let Some(index) = state.leases.remove(ack_id) {
                state.messages[index].acked = true;
            }
        }
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<(), PullError> {
        let until = Instant::now() + Duration::from_secs(u64::from(ack_deadline_seconds));
        let mut state = self.state.lock().unwrap();
        for ack_id in ack_ids {
            let index = state.leases.get(ack_id).copied();
            if let Some(index) = index {
                state.messages[index].leased_until = Some(until);
            }
        }
        Ok(())
    }
}

// ===== Stream =====

#[derive(Default)]
struct SinkState {
    batches: Vec<Vec<PutMessagesEntry>>,
    // message key -> remaining rejections
    rejections: HashMap<String, u32>,
    failures: VecDeque<u16>,
    always_fail: Option<u16>,
}

/// Stream that accepts everything unless told otherwise.
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
    calls: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `status`.
    pub fn failing(status: u16) -> Self {
        let sink = Self::default();
        sink.state.lock().unwrap().always_fail = Some(status);
        sink
    }

    /// Reject the entry keyed `key` for its next `times` submissions.
    pub fn reject_key(&self, key: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .rejections
            .insert(key.to_string(), times);
    }

    /// Fail the next whole call with `status`.
    pub fn fail_next(&self, status: u16) {
        self.state.lock().unwrap().failures.push_back(status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sizes of the batches that reached the stream, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .map(Vec::len)
            .collect()
    }

    pub fn batches(&self) -> Vec<Vec<PutMessagesEntry>> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Keys of every submitted entry, in submission order.
    pub fn submitted_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .filter_map(|e| e.key.as_ref())
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    /// Parsed values of every submitted entry.
    pub fn submitted_values(&self) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .map(|e| serde_json::from_slice(&e.value).unwrap())
            .collect()
    }
}

#[async_trait]
impl StreamSink for RecordingSink {
    fn stream_id(&self) -> &str {
        "ocid1.stream.oc1.test.recording"
    }

    async fn put_messages(
        &self,
        entries: &[PutMessagesEntry],
    ) -> Result<Vec<EntryResult>, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        let failure = state.always_fail.or_else(|| state.failures.pop_front());
        if let Some(status) = failure {
            return Err(SinkError::Status {
                status,
                message: "scripted failure".to_string(),
            });
        }

        state.batches.push(entries.to_vec());
        let offset_base = state.batches.iter().map(Vec::len).sum::<usize>() - entries.len();

        let mut results = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let key = entry
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default();
            let rejected = match state.rejections.get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };

            results.push(if rejected {
                EntryResult::Rejected {
                    error: "500".to_string(),
                    message: "InternalServerError".to_string(),
                }
            } else {
                EntryResult::Accepted {
                    partition: "0".to_string(),
                    offset: (offset_base + i) as i64,
                }
            });
        }

        Ok(results)
    }
}
