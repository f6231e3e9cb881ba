use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Run until interrupted.
    Continuous,
    /// Stop once nothing has happened for the inactivity timeout.
    Drain,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Continuous => write!(f, "continuous"),
            RunMode::Drain => write!(f, "drain"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Starting,
            1 => BridgeState::Running,
            2 => BridgeState::Draining,
            _ => BridgeState::Stopped,
        }
    }
}

/// Cumulative counters of one bridge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub processed: u64,
    pub sent: u64,
    pub failed: u64,
    pub errors: u64,
    pub skipped: u64,
    pub batches: u64,
}

impl SessionSummary {
    /// Process exit status: the number of records that failed to forward,
    /// saturated at 255 so large counts never wrap to a healthy 0.
    pub fn exit_code(&self) -> i32 {
        self.failed.min(255) as i32
    }
}

/// Run state shared by the bridge loop, its message handler and the sender.
///
/// Counters only ever grow. Activity is tracked as an offset from session
/// start so it can be touched without locking.
#[derive(Debug)]
pub struct BridgeSession {
    mode: RunMode,
    started: Instant,
    state: AtomicU8,
    last_activity_ms: AtomicU64,
    processed: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    batches: AtomicU64,
    fatal: CancellationToken,
    fatal_reason: Mutex<Option<String>>,
}

impl BridgeSession {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            started: Instant::now(),
            state: AtomicU8::new(BridgeState::Starting as u8),
            last_activity_ms: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            fatal: CancellationToken::new(),
            fatal_reason: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`; states never go backwards.
    pub fn transition(&self, next: BridgeState) -> BridgeState {
        let previous = self.state.fetch_max(next as u8, Ordering::AcqRel);
        BridgeState::from_u8(previous)
    }

    /// Mark "something happened now" for the drain-mode inactivity timer.
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the most recent message or batch flush.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.started.elapsed().saturating_sub(last)
    }

    pub fn record_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a batch the destination answered for.
    pub fn record_batch(&self) -> u64 {
        self.batches.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            processed: self.processed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }

    /// Report an unrecoverable error. The first reason wins.
    pub fn signal_fatal(&self, reason: impl Into<String>) {
        if let Ok(mut guard) = self.fatal_reason.lock() {
            if guard.is_none() {
                *guard = Some(reason.into());
            }
        }
        self.fatal.cancel();
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_cancelled()
    }

    /// Resolves once [`signal_fatal`](Self::signal_fatal) has been called.
    pub async fn fatal_signalled(&self) {
        self.fatal.cancelled().await
    }
}
