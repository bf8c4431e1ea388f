use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat { #[default] Text, Json }

/// `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str, format: &LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => tracing_subscriber::registry().with(env).with(base.json()).try_init()?,
        LogFormat::Text => tracing_subscriber::registry().with(env).with(base.compact()).try_init()?,
    }
    Ok(())
}
