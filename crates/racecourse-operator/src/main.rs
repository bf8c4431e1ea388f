use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use kube::Client;
use racecourse_operator::{controller, logging::{init_logging, LogFormat}, telemetry, OperatorConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "racecourse-operator", version, about = "Converges Racecourse resources into a Deployment, Service and Ingress")]
struct Cli {
    /// Log level (trace|debug|info|warn|error); RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Config file. In-cluster, mount it and point here; locally the
    /// per-user operator.toml is used when unset
    #[arg(long, env = "RACECOURSE_CONFIG")]
    config: Option<PathBuf>,
    /// Watch a single namespace instead of the whole cluster
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format)?;
    let mut cfg = OperatorConfig::load(cli.config.as_deref())?;
    if cli.namespace.is_some() {
        cfg.namespace = cli.namespace;
    }
    let client = Client::try_default().await?;
    info!(image = %cfg.image, metrics = %cfg.metrics_addr, "operator starting");

    let metrics_addr = cfg.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = telemetry::serve(metrics_addr).await {
            error!(error = %e, "metrics endpoint stopped");
        }
    });

    controller::run(client, cfg).await
}
