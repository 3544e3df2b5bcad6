use anyhow::Context;
use audit_stream::config::PipelineConfig;
use audit_stream::pipeline::Pipeline;
use audit_stream::{logging, provider};
use clap::Parser;
use std::path::PathBuf;

/// Enrich, score, and aggregate audit events from the bus
#[derive(Debug, Parser)]
#[command(name = "audit-stream", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "audit-stream.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.apply_env().context("applying environment overrides")?;
    config.validate().context("invalid configuration")?;

    logging::init(&config.log);

    if cli.check {
        tracing::info!(path = %cli.config.display(), "Configuration is valid");
        return Ok(());
    }

    let provider = provider::connect(&config.bus)
        .await
        .context("connecting to the bus")?;

    let report = Pipeline::new(config, provider)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!(
        received = report.received,
        enriched = report.enriched_published,
        windows = report.windows_emitted,
        anomalies = report.anomalies,
        "Shut down cleanly"
    );
    Ok(())
}
