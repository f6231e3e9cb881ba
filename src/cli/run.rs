use crate::bridge::{Bridge, BridgeSettings};
use crate::config::{load_config, load_private_key, mask, resolve_config_path, BridgeConfig, ConfigError};
use crate::record::ProviderTag;
use crate::sender::{BatchLimits, SenderSettings};
use crate::session::{BridgeSession, RunMode};
use crate::sink::{OciStreamClient, RequestSigner, SignerError, SinkError};
use crate::source::{AuthError, GcpAuthenticator, PubSubClient, PullError, SubscriberSettings};
use crate::source::pubsub::PUBSUB_URL;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("GCP authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Pub/Sub client error: {0}")]
    Pull(#[from] PullError),

    #[error("OCI signing key error: {0}")]
    Signer(#[from] SignerError),

    #[error("OCI Streaming client error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub drain: bool,
    pub config_path: Option<PathBuf>,
}

/// Run the bridge to completion and return the process exit code.
pub async fn run(options: RunOptions) -> Result<i32, RunError> {
    let config = match resolve_config_path(options.config_path.as_deref()) {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            load_config(&path)?
        }
        None => BridgeConfig::from_env()?,
    };

    let mode = if options.drain {
        RunMode::Drain
    } else {
        RunMode::Continuous
    };

    run_bridge(config, mode).await
}

async fn run_bridge(config: BridgeConfig, mode: RunMode) -> Result<i32, RunError> {
    let source = &config.source;
    let destination = &config.destination;

    info!(
        mode = %mode,
        project = %source.project_id,
        subscription = %source.subscription,
        topic = %source.topic,
        emulator = source.emulator_host.is_some(),
        endpoint = %mask(&destination.message_endpoint, 30),
        stream = %mask(&destination.stream_ocid, 20),
        user = %mask(&destination.user_ocid, 16),
        tenancy = %mask(&destination.tenancy_ocid, 16),
        fingerprint = %mask(&destination.fingerprint, 6),
        region = %destination.region,
        max_batch_size = config.batch.max_records,
        max_batch_bytes = config.batch.max_bytes,
        "Initializing bridge"
    );

    let (base_url, auth) = match &source.emulator_host {
        Some(host) => (
            PubSubClient::emulator_url(host),
            GcpAuthenticator::build(None, true).await?,
        ),
        None => (
            PUBSUB_URL.to_string(),
            GcpAuthenticator::build(source.credentials_file.as_deref(), false).await?,
        ),
    };
    let pull_client = PubSubClient::new(
        base_url,
        &source.project_id,
        &source.subscription,
        auth,
        config.bridge.request_timeout,
    )?;

    let key_pem = load_private_key(destination)?;
    let signer = RequestSigner::new(
        &destination.tenancy_ocid,
        &destination.user_ocid,
        &destination.fingerprint,
        &key_pem,
        destination.key_passphrase.as_deref(),
    )?;
    let sink = OciStreamClient::new(
        &destination.message_endpoint,
        &destination.stream_ocid,
        signer,
        config.bridge.request_timeout,
    )?;

    let subscriber_settings = SubscriberSettings {
        max_messages: source.pull_max_messages,
        max_concurrency: source.max_concurrent_messages,
        ack_deadline_seconds: Some(source.ack_deadline_seconds),
        ..Default::default()
    };
    let sender_settings = SenderSettings {
        limits: BatchLimits {
            max_records: config.batch.max_records,
            max_bytes: config.batch.max_bytes,
        },
        flush_interval: config.batch.flush_interval,
        max_attempts: config.batch.send_max_attempts,
        max_pending_batches: config.batch.max_pending_batches,
        ..Default::default()
    };
    let bridge_settings = BridgeSettings {
        inactivity_timeout: config.bridge.inactivity_timeout,
        drain_check_interval: config.bridge.drain_check_interval,
        ack_flush_timeout: config.bridge.ack_flush_timeout,
        tag: ProviderTag::new(&config.bridge.provider_field, &config.bridge.provider_tag),
    };

    let session = Arc::new(BridgeSession::new(mode));
    let bridge = Bridge::new(
        Arc::new(pull_client),
        subscriber_settings,
        Arc::new(sink),
        sender_settings,
        bridge_settings,
        session,
    );

    match bridge.run(shutdown_signal()).await {
        Ok(summary) => Ok(summary.exit_code()),
        Err(e) => {
            error!(error = %e, "Bridge terminated");
            Ok(e.exit_code())
        }
    }
}

/// Resolves on SIGINT, or SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
