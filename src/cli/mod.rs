//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the reaper sidecar (`reaper`)
//! - Removing a session's resources right away (`prune --session <id>`)

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::{ColorChoice, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{DockerEngine, Engine};
use crate::reaper::{PruneReport, ReaperServer, prune};
use crate::session::Session;

#[derive(Parser, Debug)]
#[command(name = "throwaway")]
#[command(about = "Reaper sidecar and cleanup tools for disposable test containers")]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the reaper sidecar until its clients are gone, then prune
    Reaper {
        /// Port to listen on
        #[arg(long, env = "THROWAWAY_REAPER_PORT")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
    },

    /// Remove every reapable resource of a session now
    Prune {
        /// Session id, as found in the `dev.throwaway.session-id` label
        #[arg(long)]
        session: String,
    },
}

/// Run the sidecar. Returns the prune report, if a prune happened.
pub async fn run_reaper_command(
    config: &Config,
    port: Option<u16>,
    bind: IpAddr,
) -> anyhow::Result<Option<PruneReport>> {
    let engine: Arc<dyn Engine> = Arc::new(DockerEngine::connect(&config.engine).await?);
    let addr = SocketAddr::new(bind, port.unwrap_or(config.reaper.port));
    let server = ReaperServer::bind(engine, &config.reaper, addr).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    Ok(server.run(shutdown).await?)
}

/// Prune one session immediately.
pub async fn run_prune_command(config: &Config, session: &str) -> anyhow::Result<PruneReport> {
    let engine = DockerEngine::connect(&config.engine).await?;
    let sets = [Session::with_id(session).filter_set()].into_iter().collect();
    Ok(prune(&engine, &sets).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reaper_defaults() {
        let cli = Cli::try_parse_from(["throwaway", "reaper"]).unwrap();
        match cli.command {
            Command::Reaper { bind, .. } => assert_eq!(bind.to_string(), "0.0.0.0"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_prune_requires_session() {
        assert!(Cli::try_parse_from(["throwaway", "prune"]).is_err());
        let cli = Cli::try_parse_from(["throwaway", "prune", "--session", "abc"]).unwrap();
        assert!(matches!(cli.command, Command::Prune { session } if session == "abc"));
    }
}
