//! Headless sideline host.
//!
//! Loads the TOML config (path from `SIDELINE_CONFIG` or the per-user
//! default), starts one engine runtime, and runs until Ctrl-C. All
//! diagnostics go to stderr.

use sideline::{Runtime, SidelineConfig};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var_os("SIDELINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(SidelineConfig::default_config_path);
    let config = if config_path.exists() {
        SidelineConfig::from_file(&config_path)
            .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", config_path.display()))?
    } else {
        tracing::info!(
            "no config at {}, using defaults (sync disabled)",
            config_path.display()
        );
        SidelineConfig::default()
    };

    let runtime = Runtime::new(config).map_err(|e| anyhow::anyhow!("cannot start: {e}"))?;
    runtime.start();
    runtime.refresh_now().await;

    tracing::info!("sideline-host running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown();
    tracing::info!("sideline-host shut down cleanly");
    Ok(())
}
