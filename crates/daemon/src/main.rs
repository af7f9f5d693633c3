//! PtyRelay Daemon
//!
//! Serves pty-backed shells to browser terminals over websockets.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{RelayServer, ServerEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// PtyRelay - interactive shells for browser terminals.
#[derive(Parser, Debug)]
#[command(name = "ptyrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the relay server
    Start {
        /// Address to listen on (overrides the config file)
        #[arg(long, short, value_name = "ADDR")]
        listen: Option<String>,

        /// Shell to spawn for each client (overrides the config file)
        #[arg(long, short, value_name = "PATH")]
        shell: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Start { listen, shell } => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(shell) = shell {
                config.session.default_shell = shell;
            }
            config.validate()?;

            let _guard = init_tracing(&config, cli.verbose)?;
            tracing::info!(config = %config_path.display(), "PtyRelay daemon starting...");

            let mut server = RelayServer::new(config)?;
            run_headless(&mut server).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            println!("# {}", config_path.display());
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            init_config(&config_path, force)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// Logs go to stderr, or to a daily-rolling file when `log_dir` is set. The
/// returned guard flushes the file writer and must live until exit.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };

    match config.daemon.log_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ptyrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Writes the default configuration, refusing to clobber an existing file.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)
}

/// Run the server until SIGINT or SIGTERM.
async fn run_headless(server: &mut RelayServer) -> anyhow::Result<()> {
    let addr = server.start().await?;
    println!("PtyRelay listening on ws://{}", addr);

    // Subscribe to server events for logging
    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::StateChanged(state) => {
                    tracing::debug!("Server state: {:?}", state);
                }
                ServerEvent::ClientConnected {
                    connection_id,
                    peer,
                } => {
                    tracing::debug!(connection_id = %connection_id, peer = %peer, "Client connected");
                }
                ServerEvent::ClientDisconnected {
                    connection_id,
                    outcome,
                } => {
                    tracing::debug!(connection_id = %connection_id, ?outcome, "Client disconnected");
                }
                ServerEvent::Error { message } => {
                    tracing::error!("Server error: {}", message);
                }
            }
        }
    });

    let signal = wait_for_shutdown_signal().await;
    if let Err(ref e) = signal {
        tracing::error!(error = %e, "Failed to listen for shutdown signals, stopping");
    }
    tracing::info!("Received shutdown signal");

    server.stop().await?;
    signal.context("Signal handler failed")
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["ptyrelay", "start"]).unwrap();
        match cli.command {
            Commands::Start { listen, shell } => {
                assert!(listen.is_none());
                assert!(shell.is_none());
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_overrides() {
        let cli = Cli::try_parse_from([
            "ptyrelay",
            "start",
            "--listen",
            "0.0.0.0:9000",
            "--shell",
            "/bin/bash",
        ])
        .unwrap();
        match cli.command {
            Commands::Start { listen, shell } => {
                assert_eq!(listen.as_deref(), Some("0.0.0.0:9000"));
                assert_eq!(shell.as_deref(), Some("/bin/bash"));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["ptyrelay", "start", "--verbose", "--config", "/tmp/x.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["ptyrelay", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["ptyrelay", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["ptyrelay", "pair"]).is_err());
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ptyrelay").join("config.toml");

        init_config(&path, false).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }
}
