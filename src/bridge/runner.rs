use crate::bridge::handler::ForwardingHandler;
use crate::record::ProviderTag;
use crate::sender::{BatchingSender, SenderSettings};
use crate::session::{BridgeSession, BridgeState, RunMode, SessionSummary};
use crate::sink::StreamSink;
use crate::source::{PullClient, Subscriber, SubscriberSettings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge stopped on unrecoverable error: {reason}")]
    Fatal {
        reason: String,
        summary: SessionSummary,
    },
}

impl BridgeError {
    /// Failed-record count, but never zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Fatal { summary, .. } => summary.exit_code().max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Drain mode stops after this long without a message or batch flush.
    pub inactivity_timeout: Duration,
    pub drain_check_interval: Duration,
    /// Upper bound for sending the last acks during shutdown.
    pub ack_flush_timeout: Duration,
    pub tag: ProviderTag,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30),
            drain_check_interval: Duration::from_secs(1),
            ack_flush_timeout: Duration::from_secs(10),
            tag: ProviderTag::default(),
        }
    }
}

#[derive(Debug)]
enum StopReason {
    Shutdown,
    Inactive(Duration),
    Fatal,
}

/// Forwarding loop from a pull subscription to a stream.
pub struct Bridge {
    subscriber: Subscriber,
    sender: BatchingSender,
    settings: BridgeSettings,
    session: Arc<BridgeSession>,
}

impl Bridge {
    pub fn new(
        client: Arc<dyn PullClient>,
        subscriber_settings: SubscriberSettings,
        sink: Arc<dyn StreamSink>,
        sender_settings: SenderSettings,
        settings: BridgeSettings,
        session: Arc<BridgeSession>,
    ) -> Self {
        let sender = BatchingSender::new(sink, sender_settings, Arc::clone(&session));
        Self {
            subscriber: Subscriber::new(client, subscriber_settings),
            sender,
            settings,
            session,
        }
    }

    pub fn session(&self) -> &Arc<BridgeSession> {
        &self.session
    }

    pub fn sender(&self) -> &BatchingSender {
        &self.sender
    }

    /// Forward until `shutdown` resolves, the drain window passes, or either
    /// side fails unrecoverably; then drain and report the final counters.
    pub async fn run<F>(&self, shutdown: F) -> Result<SessionSummary, BridgeError>
    where
        F: Future<Output = ()>,
    {
        let handler = Arc::new(ForwardingHandler::new(
            self.sender.clone(),
            Arc::clone(&self.session),
            self.settings.tag.clone(),
        ));

        self.session.touch();
        let subscription = self.subscriber.start(Arc::clone(&handler));
        self.session.transition(BridgeState::Running);
        info!(
            subscription = %self.subscriber.subscription(),
            mode = %self.session.mode(),
            "Bridge running"
        );

        let reason = self.wait_for_stop(shutdown).await;
        self.session.transition(BridgeState::Draining);
        match &reason {
            StopReason::Shutdown => info!("Shutdown requested, draining"),
            StopReason::Inactive(idle) => info!(
                idle_secs = idle.as_secs(),
                "No activity within the inactivity window, draining"
            ),
            StopReason::Fatal => error!(
                reason = %self.session.fatal_reason().unwrap_or_default(),
                "Unrecoverable error, draining"
            ),
        }

        subscription.stop().await;
        self.sender.flush().await;
        handler.wait_for_outcomes().await;
        subscription.finish(self.settings.ack_flush_timeout).await;
        self.sender.shutdown().await;

        self.session.transition(BridgeState::Stopped);
        let summary = self.session.summary();
        info!(
            mode = %self.session.mode(),
            processed = summary.processed,
            sent = summary.sent,
            failed = summary.failed,
            errors = summary.errors,
            skipped = summary.skipped,
            batches = summary.batches,
            "Bridge stopped"
        );

        match self.session.fatal_reason() {
            Some(reason) => Err(BridgeError::Fatal { reason, summary }),
            None => Ok(summary),
        }
    }

    async fn wait_for_stop<F>(&self, shutdown: F) -> StopReason
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        match self.session.mode() {
            RunMode::Continuous => tokio::select! {
                _ = &mut shutdown => StopReason::Shutdown,
                _ = self.session.fatal_signalled() => StopReason::Fatal,
            },
            RunMode::Drain => loop {
                tokio::select! {
                    _ = &mut shutdown => return StopReason::Shutdown,
                    _ = self.session.fatal_signalled() => return StopReason::Fatal,
                    _ = tokio::time::sleep(self.settings.drain_check_interval) => {}
                }

                let idle = self.session.idle_for();
                if idle >= self.settings.inactivity_timeout {
                    return StopReason::Inactive(idle);
                }
            },
        }
    }
}
