//! throwaway - reaper sidecar entry point.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use throwaway::{
    cli::{Cli, Command, run_prune_command, run_reaper_command},
    config::Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("throwaway=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::resolve()?;

    match cli.command {
        Command::Reaper { port, bind } => {
            match run_reaper_command(&config, port, bind).await? {
                Some(report) if !report.failures.is_empty() => {
                    anyhow::bail!("prune left {} resource(s) behind", report.failures.len());
                }
                _ => {}
            }
        }
        Command::Prune { session } => {
            let report = run_prune_command(&config, &session).await?;
            println!(
                "Removed {} container(s) and {} network(s)",
                report.containers.len(),
                report.networks.len()
            );
            if !report.failures.is_empty() {
                anyhow::bail!("prune left {} resource(s) behind", report.failures.len());
            }
        }
    }

    Ok(())
}
