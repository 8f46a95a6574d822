use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use tool_proxy::config::{self, CONFIG_ENV_VAR};
use tool_proxy::logging::{self, LogFormat, LogOptions};

#[derive(Parser)]
#[command(name = "tool-proxy")]
#[command(version, about = "Supervise stdio tool providers and serve one capability catalog")]
struct Args {
    /// Configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Log filter directive, e.g. "debug" or "tool_proxy=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Write logs to this file (rotated on startup) instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init_tracing(&LogOptions {
        level: args.log_level.clone(),
        format: args.log_format,
        file: args.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let config_path = config::resolve_config_path(args.config.as_deref());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        pid = std::process::id(),
        "=== tool-proxy starting ==="
    );

    let mut proxy_config = config::load_config(&config_path)
        .with_context(|| format!("cannot load configuration from {}", config_path.display()))?;
    if let Some(listen) = args.listen {
        proxy_config.listen = listen;
    }

    tool_proxy::run(proxy_config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    })
    .await
    .context("proxy failed")?;

    Ok(())
}
