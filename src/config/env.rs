use crate::config::expand_tilde;
use crate::config::parse::{validate_config, ConfigError};
use crate::config::types::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

impl BridgeConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from `lookup`, which maps a variable name to
    /// its value. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = EnvReader {
            lookup: |key: &str| lookup(key).filter(|v| !v.trim().is_empty()),
            errors: Vec::new(),
        };

        let source = SourceConfig {
            project_id: env.required("GCP_PROJECT_ID"),
            subscription: env.required("GCP_PUBSUB_SUBSCRIPTION"),
            topic: env
                .optional("GCP_PUBSUB_TOPIC")
                .unwrap_or_else(|| "oci-log-export-topic".to_string()),
            credentials_file: env
                .optional("GOOGLE_APPLICATION_CREDENTIALS")
                .map(|p| expand_tilde(&PathBuf::from(p))),
            emulator_host: env.optional("PUBSUB_EMULATOR_HOST"),
            pull_max_messages: env.number("PULL_MAX_MESSAGES", 1000),
            ack_deadline_seconds: env.number("ACK_DEADLINE_SECONDS", 60),
            max_concurrent_messages: env.number("MAX_CONCURRENT_MESSAGES", 100),
        };

        let destination = DestinationConfig {
            message_endpoint: env.required("OCI_MESSAGE_ENDPOINT"),
            stream_ocid: env.required("OCI_STREAM_OCID"),
            key_file: env
                .optional("OCI_KEY_FILE")
                .map(|p| expand_tilde(&PathBuf::from(p))),
            key_content: env.optional("OCI_KEY_CONTENT"),
            key_passphrase: env.optional("OCI_KEY_PASSPHRASE"),
            user_ocid: env.required("OCI_USER_OCID"),
            fingerprint: env.required("OCI_FINGERPRINT"),
            tenancy_ocid: env.required("OCI_TENANCY_OCID"),
            region: env.required("OCI_REGION"),
        };

        // 0 disables the linger flush.
        let flush_secs: u64 = env.number("FLUSH_INTERVAL_SECONDS", 5);
        let batch = BatchConfig {
            max_records: env.number("MAX_BATCH_SIZE", 100),
            max_bytes: env.number("MAX_BATCH_BYTES", 1024 * 1024),
            flush_interval: (flush_secs > 0).then(|| Duration::from_secs(flush_secs)),
            send_max_attempts: env.number("SEND_MAX_ATTEMPTS", 5),
            max_pending_batches: env.number("MAX_PENDING_BATCHES", 4),
        };

        let defaults = RunConfig::default();
        let bridge = RunConfig {
            inactivity_timeout: Duration::from_secs(env.number("INACTIVITY_TIMEOUT", 30)),
            provider_tag: env
                .optional("PROVIDER_TAG")
                .unwrap_or(defaults.provider_tag.clone()),
            ..defaults
        };

        if !env.errors.is_empty() {
            return Err(ConfigError::ValidationList(env.errors));
        }

        let config = BridgeConfig {
            source,
            destination,
            batch,
            bridge,
        };
        validate_config(&config)?;
        Ok(config)
    }
}

struct EnvReader<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string())
    }

    fn required(&mut self, key: &str) -> String {
        match self.optional(key) {
            Some(value) => value,
            None => {
                self.errors.push(format!("{} is not set", key));
                String::new()
            }
        }
    }

    fn number<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr + Copy,
    {
        match self.optional(key) {
            None => default,
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    self.errors
                        .push(format!("{} must be a non-negative integer, got '{}'", key, raw));
                    default
                }
            },
        }
    }
}
