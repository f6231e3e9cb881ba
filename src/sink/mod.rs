pub mod oci;
pub mod signer;

pub use oci::OciStreamClient;
pub use signer::{RequestSigner, SignerError};

use async_trait::async_trait;
use thiserror::Error;

/// Largest number of messages a single PutMessages call may carry.
pub const MAX_MESSAGES_PER_REQUEST: usize = 100;

/// Largest PutMessages request the stream accepts, in bytes.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream returned error status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stream endpoint: {0}")]
    Endpoint(String),
}

impl SinkError {
    /// Worth another attempt after a backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            SinkError::Http(_) => true,
            SinkError::Status { status, .. } => matches!(*status, 408 | 409 | 429) || *status >= 500,
            SinkError::Signing(_) | SinkError::Json(_) | SinkError::Endpoint(_) => false,
        }
    }

    /// The destination refuses us outright; carrying on would only spin.
    pub fn is_fatal(&self) -> bool {
        match self {
            SinkError::Status { status, .. } => matches!(*status, 401 | 403 | 404),
            SinkError::Signing(_) | SinkError::Endpoint(_) => true,
            SinkError::Http(_) | SinkError::Json(_) => false,
        }
    }
}

/// One message submitted to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutMessagesEntry {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Outcome of one entry, at the same position as the submitted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryResult {
    Accepted { partition: String, offset: i64 },
    Rejected { error: String, message: String },
}

impl EntryResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EntryResult::Accepted { .. })
    }
}

/// Push side of the bridge: a partitioned message stream.
#[async_trait]
pub trait StreamSink: Send + Sync {
    fn stream_id(&self) -> &str;

    /// Submit `entries` in one call; the result holds one entry per input,
    /// in order.
    async fn put_messages(
        &self,
        entries: &[PutMessagesEntry],
    ) -> Result<Vec<EntryResult>, SinkError>;
}
