use super::types::*;
use crate::config::{expand_env_vars, expand_tilde};
use regex::Regex;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid private key: {0}")]
    Key(String),
}

pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(&yaml_string);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: BridgeConfig = serde_yaml::from_str(&yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        ))
    })?;

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with the actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut BridgeConfig) {
    if let Some(path) = config.source.credentials_file.as_mut() {
        *path = expand_tilde(path);
    }
    if let Some(path) = config.destination.key_file.as_mut() {
        *path = expand_tilde(path);
    }
}

/// Check a fully assembled config, reporting every problem at once.
pub fn validate_config(config: &BridgeConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_source(&config.source, &mut errors);
    validate_destination(&config.destination, &mut errors);
    validate_batch(&config.batch, &mut errors);
    validate_run(&config.bridge, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    if source.project_id.trim().is_empty() {
        errors.push("source.project_id cannot be empty".to_string());
    }
    if source.subscription.trim().is_empty() {
        errors.push("source.subscription cannot be empty".to_string());
    }
    if source.pull_max_messages == 0 {
        errors.push("source.pull_max_messages must be at least 1".to_string());
    }
    if source.max_concurrent_messages == 0 {
        errors.push("source.max_concurrent_messages must be at least 1".to_string());
    }
    if !(10..=600).contains(&source.ack_deadline_seconds) {
        errors.push(format!(
            "source.ack_deadline_seconds must be between 10 and 600, got {}",
            source.ack_deadline_seconds
        ));
    }
}

fn validate_destination(destination: &DestinationConfig, errors: &mut Vec<String>) {
    let endpoint = destination.message_endpoint.trim();
    if endpoint.is_empty() {
        errors.push("destination.message_endpoint cannot be empty".to_string());
    } else if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
        errors.push(format!(
            "destination.message_endpoint must be an http(s) URL, got '{}'",
            endpoint
        ));
    }

    if destination.stream_ocid.trim().is_empty() {
        errors.push("destination.stream_ocid cannot be empty".to_string());
    } else if destination.stream_ocid.contains("streampool") {
        errors.push(
            "destination.stream_ocid points to a stream pool; use the stream OCID (ocid1.stream...) instead"
                .to_string(),
        );
    }

    let has_key_content = destination
        .key_content
        .as_deref()
        .is_some_and(|c| !c.trim().is_empty());
    if destination.key_file.is_none() && !has_key_content {
        errors.push("destination: set either key_file or key_content".to_string());
    }

    for (name, value) in [
        ("user_ocid", &destination.user_ocid),
        ("fingerprint", &destination.fingerprint),
        ("tenancy_ocid", &destination.tenancy_ocid),
        ("region", &destination.region),
    ] {
        if value.trim().is_empty() {
            errors.push(format!("destination.{} cannot be empty", name));
        }
    }
}

fn validate_batch(batch: &BatchConfig, errors: &mut Vec<String>) {
    if batch.max_records == 0 || batch.max_records > crate::sink::MAX_MESSAGES_PER_REQUEST {
        errors.push(format!(
            "batch.max_records must be between 1 and {}, got {}",
            crate::sink::MAX_MESSAGES_PER_REQUEST,
            batch.max_records
        ));
    }
    if batch.max_bytes <= crate::sender::ENTRY_OVERHEAD_BYTES
        || batch.max_bytes > crate::sink::MAX_REQUEST_BYTES
    {
        errors.push(format!(
            "batch.max_bytes must be between {} and {}, got {}",
            crate::sender::ENTRY_OVERHEAD_BYTES + 1,
            crate::sink::MAX_REQUEST_BYTES,
            batch.max_bytes
        ));
    }
    if batch.flush_interval.is_some_and(|d| d.is_zero()) {
        errors.push("batch.flush_interval must be positive or 'infinite'".to_string());
    }
    if batch.send_max_attempts == 0 {
        errors.push("batch.send_max_attempts must be at least 1".to_string());
    }
    if batch.max_pending_batches == 0 {
        errors.push("batch.max_pending_batches must be at least 1".to_string());
    }
}

fn validate_run(run: &RunConfig, errors: &mut Vec<String>) {
    if run.inactivity_timeout.is_zero() {
        errors.push("bridge.inactivity_timeout must be positive".to_string());
    }
    if run.drain_check_interval.is_zero() {
        errors.push("bridge.drain_check_interval must be positive".to_string());
    }
    if run.provider_field.trim().is_empty() {
        errors.push("bridge.provider_field cannot be empty".to_string());
    }
}
