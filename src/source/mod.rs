pub mod auth;
pub mod pubsub;
pub mod subscriber;

pub use auth::{AuthError, GcpAuthenticator};
pub use pubsub::PubSubClient;
pub use subscriber::{AckHandle, MessageHandler, Subscriber, SubscriberSettings, SubscriptionHandle};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PullError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Pub/Sub returned error status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid Pub/Sub response: {0}")]
    Decode(String),
}

impl PullError {
    /// Whether the pull loop should back off and try again.
    ///
    /// Permission, auth and missing-subscription failures are permanent.
    pub fn is_retriable(&self) -> bool {
        match self {
            PullError::Http(_) | PullError::Decode(_) => true,
            PullError::Auth(e) => e.is_retriable(),
            PullError::Status { status, .. } => {
                matches!(*status, 408 | 409 | 429) || *status >= 500
            }
        }
    }
}

/// One delivery of a queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message_id: String,
    pub data: Vec<u8>,
    pub publish_time: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, String>,
    pub delivery_attempt: Option<u32>,
}

/// Request/response operations of a pull subscription.
#[async_trait]
pub trait PullClient: Send + Sync {
    /// Fully qualified subscription name, for logging.
    fn subscription(&self) -> &str;

    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, PullError>;

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), PullError>;

    /// A deadline of zero makes the messages immediately available again.
    async fn modify_ack_deadline(
        &self,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<(), PullError>;
}
