/// Flux CLI - main entry point
use colored::*;
use flux_core::{cli_app, Config};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Quiet by default; RUST_LOG=flux_core=debug for the details
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let (config, rest) =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    if let Err(e) = cli_app::run(config, rest).await {
        eprintln!("{} {}", "✗".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
