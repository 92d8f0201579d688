use clap::Parser;
use muxq::cli::{self, Args};
use muxq::config::AppConfig;
use muxq::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before reading any MUXQ_* override
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(store) = args.store {
        config.store_path = store;
    }

    let _log_guard = logging::init_logging(config.log_filter.as_deref(), config.log_dir.as_deref())?;
    tracing::debug!(?config, "Configuration loaded");

    cli::execute(args.command, &config).await?;
    Ok(())
}
