use crate::sink::{EntryResult, PutMessagesEntry, RequestSigner, SinkError, StreamSink};
use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const STREAMING_API_VERSION: &str = "20180418";

/// OCI Streaming `PutMessages` client for a single stream.
#[derive(Debug)]
pub struct OciStreamClient {
    client: reqwest::Client,
    url: Url,
    stream_id: String,
    signer: RequestSigner,
}

impl OciStreamClient {
    pub fn new(
        message_endpoint: &str,
        stream_id: &str,
        signer: RequestSigner,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = messages_url(message_endpoint, stream_id)?;

        Ok(Self {
            client,
            url,
            stream_id: stream_id.to_string(),
            signer,
        })
    }
}

fn messages_url(message_endpoint: &str, stream_id: &str) -> Result<Url, SinkError> {
    let raw = format!(
        "{}/{}/streams/{}/messages",
        message_endpoint.trim_end_matches('/'),
        STREAMING_API_VERSION,
        stream_id
    );
    Url::parse(&raw).map_err(|e| SinkError::Endpoint(format!("{raw}: {e}")))
}

#[async_trait]
impl StreamSink for OciStreamClient {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    async fn put_messages(
        &self,
        entries: &[PutMessagesEntry],
    ) -> Result<Vec<EntryResult>, SinkError> {
        let details = PutMessagesDetails {
            messages: entries
                .iter()
                .map(|entry| WireEntry {
                    key: entry.key.as_ref().map(|key| BASE64_STANDARD.encode(key)),
                    value: BASE64_STANDARD.encode(&entry.value),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&details)?;

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let signed = self.signer.sign_post(&self.url, &body, &date)?;

        let response = self
            .client
            .post(self.url.clone())
            .header("date", signed.date)
            .header("x-content-sha256", signed.content_sha256)
            .header(reqwest::header::CONTENT_TYPE, signed.content_type)
            .header(reqwest::header::AUTHORIZATION, signed.authorization)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SinkError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let result: PutMessagesResult = serde_json::from_slice(&response.bytes().await?)?;
        debug!(
            entries = result.entries.len(),
            failures = result.failures,
            "PutMessages response"
        );

        Ok(result.entries.into_iter().map(EntryResult::from).collect())
    }
}

// ===== Wire Types =====

#[derive(Debug, Serialize)]
struct PutMessagesDetails {
    messages: Vec<WireEntry>,
}

#[derive(Debug, Serialize)]
struct WireEntry {
    key: Option<String>,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PutMessagesResult {
    #[serde(default)]
    failures: u32,
    #[serde(default)]
    entries: Vec<WireResultEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResultEntry {
    #[serde(default)]
    partition: Option<String>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl From<WireResultEntry> for EntryResult {
    fn from(entry: WireResultEntry) -> Self {
        match entry.error {
            Some(error) => EntryResult::Rejected {
                error,
                message: entry.error_message.unwrap_or_default(),
            },
            None => EntryResult::Accepted {
                partition: entry.partition.unwrap_or_default(),
                offset: entry.offset.unwrap_or_default(),
            },
        }
    }
}
