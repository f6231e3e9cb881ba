use crate::source::{GcpAuthenticator, PullClient, PullError, ReceivedMessage};
use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

pub const PUBSUB_URL: &str = "https://pubsub.googleapis.com";

/// Pub/Sub REST (v1) client bound to one subscription.
#[derive(Debug)]
pub struct PubSubClient {
    client: reqwest::Client,
    base_url: String,
    subscription_path: String,
    auth: GcpAuthenticator,
}

impl PubSubClient {
    pub fn new(
        base_url: impl Into<String>,
        project_id: &str,
        subscription_id: &str,
        auth: GcpAuthenticator,
        timeout: Duration,
    ) -> Result<Self, PullError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            subscription_path: format!("projects/{project_id}/subscriptions/{subscription_id}"),
            auth,
        })
    }

    /// Base URL for a `PUBSUB_EMULATOR_HOST` style `host:port` value.
    pub fn emulator_url(host: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        }
    }

    fn url(&self, verb: &str) -> String {
        format!("{}/v1/{}:{}", self.base_url, self.subscription_path, verb)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        verb: &str,
        body: &B,
    ) -> Result<reqwest::Response, PullError> {
        let mut request = self.client.post(self.url(verb)).json(body);
        if let Some(header) = self.auth.authorization().await? {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PullError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PullClient for PubSubClient {
    fn subscription(&self) -> &str {
        &self.subscription_path
    }

    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, PullError> {
        let response = self.post("pull", &PullRequest { max_messages }).await?;
        let body: PullResponse = response
            .json()
            .await
            .map_err(|e| PullError::Decode(e.to_string()))?;

        let mut messages = Vec::with_capacity(body.received_messages.len());
        let mut undecodable = Vec::new();
        for received in body.received_messages {
            match BASE64_STANDARD.decode(received.message.data.as_bytes()) {
                Ok(data) => messages.push(ReceivedMessage {
                    ack_id: received.ack_id,
                    message_id: received.message.message_id,
                    data,
                    publish_time: received.message.publish_time,
                    attributes: received.message.attributes,
                    delivery_attempt: received.delivery_attempt,
                }),
                Err(e) => {
                    warn!(
                        message_id = %received.message.message_id,
                        error = %e,
                        "Pub/Sub message data is not base64, releasing it"
                    );
                    undecodable.push(received.ack_id);
                }
            }
        }

        if !undecodable.is_empty() {
            if let Err(e) = self.modify_ack_deadline(&undecodable, 0).await {
                // Their leases run out on their own.
                warn!(
                    count = undecodable.len(),
                    error = %e,
                    "Failed to release undecodable messages"
                );
            }
        }

        Ok(messages)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), PullError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.post("acknowledge", &AcknowledgeRequest { ack_ids })
            .await?;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<(), PullError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.post(
            "modifyAckDeadline",
            &ModifyAckDeadlineRequest {
                ack_ids,
                ack_deadline_seconds,
            },
        )
        .await?;
        Ok(())
    }
}

// ===== Wire Types =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WirePubsubMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    attributes: HashMap<String, String>,
}
