use clap::Parser;
use pubsub2oci::cli::{run, RunOptions};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pubsub2oci")]
#[command(about = "Forward GCP Pub/Sub log exports to OCI Streaming", long_about = None)]
struct Cli {
    /// Stop once the subscription has been quiet for the inactivity timeout
    #[arg(long)]
    drain: bool,

    /// YAML config file; without it the environment is read
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log directive when RUST_LOG is unset (e.g. debug, pubsub2oci=trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_directive = if cli.log_level.contains('=') {
        cli.log_level.clone()
    } else {
        format!("pubsub2oci={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = run(RunOptions {
        drain: cli.drain,
        config_path: cli.config,
    })
    .await?;

    std::process::exit(code);
}
