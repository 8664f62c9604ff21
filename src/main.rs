//! kled CLI entry point.

use clap::{Parser, Subcommand};
use kled::config::KledConfig;
use tracing_subscriber::EnvFilter;

mod cli;

/// kled - reproducible development workspaces on any backend
#[derive(Parser, Debug)]
#[command(name = "kled")]
#[command(about = "Reproducible development workspaces on any backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage workspaces (up, build, ssh, stop, delete, status, list).
    #[command(subcommand)]
    Workspace(cli::workspace::WorkspaceCmd),

    /// Manage provider machines directly.
    #[command(subcommand)]
    Machine(cli::machine::MachineCmd),

    /// Agent hops run on machines and inside containers.
    #[command(subcommand, hide = true)]
    Agent(cli::agent::AgentCmd),

    /// Helper processes used as transports.
    #[command(subcommand, hide = true)]
    Helper(cli::helper::HelperCmd),

    /// Managed platform access.
    #[command(subcommand)]
    Pro(cli::pro::ProCmd),
}

impl Commands {
    /// Background daemons log JSON lines to their log file.
    fn is_daemon(&self) -> bool {
        matches!(self, Commands::Agent(cmd) if cmd.is_daemon())
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.command.is_daemon());

    tracing::debug!(version = kled::VERSION, "starting kled");

    // Load configuration
    let mut config = match KledConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            KledConfig::default()
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Workspace(cmd) => cmd.run(&config),
        Commands::Machine(cmd) => cmd.run(&config),
        Commands::Agent(cmd) => cmd.run(&config),
        Commands::Helper(cmd) => cmd.run(),
        Commands::Pro(cmd) => cmd.run(&mut config),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
///
/// Logs always go to stderr: stdout carries the transport for agent hops.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if json { "kled=info,kled_agent=info" } else { "kled=warn" })
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}
