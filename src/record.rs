use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field injected into every forwarded record.
pub const DEFAULT_PROVIDER_FIELD: &str = "cloudProvider";

/// Value of the provider field for records coming out of Pub/Sub.
pub const DEFAULT_PROVIDER: &str = "GCP";

/// Key used when a non-object payload has to be wrapped to carry the tag.
pub const WRAPPED_PAYLOAD_FIELD: &str = "data";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identifies the origin cloud of a forwarded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTag {
    field: String,
    value: String,
}

impl ProviderTag {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns a new object holding `payload` plus the provider field.
    ///
    /// Objects keep every original field; an existing provider field is
    /// overwritten. Anything else is wrapped under [`WRAPPED_PAYLOAD_FIELD`].
    pub fn apply(&self, payload: &Value) -> Map<String, Value> {
        let mut tagged = match payload {
            Value::Object(fields) => fields.clone(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert(WRAPPED_PAYLOAD_FIELD.to_string(), other.clone());
                wrapped
            }
        };
        tagged.insert(self.field.clone(), Value::String(self.value.clone()));
        tagged
    }
}

impl Default for ProviderTag {
    fn default() -> Self {
        Self::new(DEFAULT_PROVIDER_FIELD, DEFAULT_PROVIDER)
    }
}

/// A tagged log entry on its way to the stream.
///
/// The body is serialized once at construction; the sender only ever reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    id: String,
    publish_time: Option<DateTime<Utc>>,
    payload: Map<String, Value>,
    body: Vec<u8>,
}

impl LogRecord {
    /// Decode a raw queue payload and tag it.
    pub fn decode(
        id: impl Into<String>,
        publish_time: Option<DateTime<Utc>>,
        data: &[u8],
        tag: &ProviderTag,
    ) -> Result<Self, RecordError> {
        let raw: Value = serde_json::from_slice(data)?;
        Self::from_value(id, publish_time, &raw, tag)
    }

    pub fn from_value(
        id: impl Into<String>,
        publish_time: Option<DateTime<Utc>>,
        raw: &Value,
        tag: &ProviderTag,
    ) -> Result<Self, RecordError> {
        let payload = tag.apply(raw);
        let body = serde_json::to_vec(&payload)?;
        Ok(Self {
            id: id.into(),
            publish_time,
            payload,
            body,
        })
    }

    /// Source-assigned message id, forwarded as the stream message key.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn publish_time(&self) -> Option<DateTime<Utc>> {
        self.publish_time
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Compact JSON encoding of the tagged payload.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
