use crate::config::key::mask;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub bridge: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub project_id: String,
    pub subscription: String,
    /// Informational; the bridge only ever reads from the subscription.
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    /// `host:port` of a Pub/Sub emulator; disables authentication.
    #[serde(default)]
    pub emulator_host: Option<String>,
    #[serde(default = "default_pull_max_messages")]
    pub pull_max_messages: usize,
    #[serde(default = "default_ack_deadline_seconds")]
    pub ack_deadline_seconds: u32,
    #[serde(default = "default_max_concurrent_messages")]
    pub max_concurrent_messages: usize,
}

fn default_topic() -> String {
    "oci-log-export-topic".to_string()
}

fn default_pull_max_messages() -> usize {
    1000
}

fn default_ack_deadline_seconds() -> u32 {
    60
}

fn default_max_concurrent_messages() -> usize {
    100
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub message_endpoint: String,
    pub stream_ocid: String,
    /// Preferred over `key_content` when both are set.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub key_content: Option<String>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
    pub user_ocid: String,
    pub fingerprint: String,
    pub tenancy_ocid: String,
    pub region: String,
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("message_endpoint", &mask(&self.message_endpoint, 24))
            .field("stream_ocid", &mask(&self.stream_ocid, 16))
            .field("key_file", &self.key_file)
            .field("key_content", &self.key_content.as_ref().map(|_| "***"))
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "***"))
            .field("user_ocid", &mask(&self.user_ocid, 16))
            .field("fingerprint", &mask(&self.fingerprint, 6))
            .field("tenancy_ocid", &mask(&self.tenancy_ocid, 16))
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// `"infinite"` turns the linger flush off.
    #[serde(default = "default_flush_interval", with = "optional_duration_format")]
    pub flush_interval: Option<Duration>,
    #[serde(default = "default_send_max_attempts")]
    pub send_max_attempts: u32,
    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_bytes: default_max_bytes(),
            flush_interval: default_flush_interval(),
            send_max_attempts: default_send_max_attempts(),
            max_pending_batches: default_max_pending_batches(),
        }
    }
}

fn default_max_records() -> usize {
    100
}

fn default_max_bytes() -> usize {
    1024 * 1024
}

fn default_flush_interval() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

fn default_send_max_attempts() -> u32 {
    5
}

fn default_max_pending_batches() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_inactivity_timeout", with = "duration_format")]
    pub inactivity_timeout: Duration,
    #[serde(default = "default_drain_check_interval", with = "duration_format")]
    pub drain_check_interval: Duration,
    #[serde(default = "default_request_timeout", with = "duration_format")]
    pub request_timeout: Duration,
    #[serde(default = "default_ack_flush_timeout", with = "duration_format")]
    pub ack_flush_timeout: Duration,
    #[serde(default = "default_provider_tag")]
    pub provider_tag: String,
    #[serde(default = "default_provider_field")]
    pub provider_field: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: default_inactivity_timeout(),
            drain_check_interval: default_drain_check_interval(),
            request_timeout: default_request_timeout(),
            ack_flush_timeout: default_ack_flush_timeout(),
            provider_tag: default_provider_tag(),
            provider_field: default_provider_field(),
        }
    }
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_drain_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ack_flush_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_provider_tag() -> String {
    crate::record::DEFAULT_PROVIDER.to_string()
}

fn default_provider_field() -> String {
    crate::record::DEFAULT_PROVIDER_FIELD.to_string()
}

// Custom serde modules for duration parsing
pub(crate) mod duration_format {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }

        let (value_str, unit) = if let Some(v) = s.strip_suffix("ms") {
            (v, "ms")
        } else if let Some(v) = s.strip_suffix('s') {
            (v, "s")
        } else if let Some(v) = s.strip_suffix('m') {
            (v, "m")
        } else if let Some(v) = s.strip_suffix('h') {
            (v, "h")
        } else {
            return Err(format!("invalid duration format: {}", s));
        };

        let value: u64 = value_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid numeric value: {}", value_str))?;

        let secs = match unit {
            "ms" => return Ok(Duration::from_millis(value)),
            "s" => Some(value),
            "m" => value.checked_mul(60),
            _ => value.checked_mul(3600),
        };

        secs.map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {}", s))
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        if d.subsec_millis() != 0 || secs == 0 {
            format!("{}ms", d.as_millis())
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }
}

pub(crate) mod optional_duration_format {
    use super::duration_format::{format_duration, parse_duration};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&format_duration(*d)),
            None => serializer.serialize_str("infinite"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "infinite" {
            Ok(None)
        } else {
            parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}
