//! Workspace commands.

use clap::{Args, Subcommand};
use kled::config::KledConfig;
use kled::orchestrator::UpOptions;
use std::path::PathBuf;
use std::time::Duration;

use super::{block_on, orchestrator, parse_duration};

/// Manage workspaces
#[derive(Subcommand, Debug)]
pub enum WorkspaceCmd {
    /// Create or resume a workspace and wait until it is ready
    Up(UpCmd),

    /// Build the workspace image without starting it
    Build(NameArg),

    /// Open an SSH session to the workspace on stdio
    Ssh(SshCmd),

    /// Stop the workspace container and its machine
    Stop(NameArg),

    /// Delete the workspace, its container and its machine
    #[command(alias = "rm")]
    Delete(NameArg),

    /// Show the state of the workspace's machine
    Status(NameArg),

    /// List workspaces
    #[command(alias = "ls")]
    List,
}

impl WorkspaceCmd {
    pub fn run(self, config: &KledConfig) -> kled::Result<()> {
        match self {
            WorkspaceCmd::Up(cmd) => cmd.run(config),
            WorkspaceCmd::Build(cmd) => {
                let log = block_on(orchestrator(config).build(&cmd.name))??;
                print!("{}", log);
                Ok(())
            }
            WorkspaceCmd::Ssh(cmd) => cmd.run(config),
            WorkspaceCmd::Stop(cmd) => {
                block_on(orchestrator(config).stop(&cmd.name))??;
                println!("Stopped workspace: {}", cmd.name);
                Ok(())
            }
            WorkspaceCmd::Delete(cmd) => {
                block_on(orchestrator(config).delete(&cmd.name))??;
                println!("Deleted workspace: {}", cmd.name);
                Ok(())
            }
            WorkspaceCmd::Status(cmd) => {
                let state = block_on(orchestrator(config).status(&cmd.name))??;
                println!("{}", state);
                Ok(())
            }
            WorkspaceCmd::List => list(config),
        }
    }
}

#[derive(Args, Debug)]
pub struct NameArg {
    /// Workspace name
    pub name: String,
}

/// Shared options for commands that bring a workspace up.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Git repository, local folder or `image:<ref>`
    pub source: Option<String>,

    /// Workspace name (derived from the source by default)
    #[arg(long)]
    pub name: Option<String>,

    /// Provider to run the workspace on
    #[arg(long)]
    pub provider: Option<String>,

    /// devcontainer.json path relative to the source
    #[arg(long)]
    pub devcontainer_path: Option<String>,

    /// Directory SSH sessions start in
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Stop the workspace after this much inactivity (e.g. "30m")
    #[arg(long, value_parser = parse_duration)]
    pub inactivity_timeout: Option<Duration>,
}

impl UpArgs {
    fn options(&self, config: &KledConfig) -> UpOptions {
        let mut options = UpOptions::from_env(config);
        options.source = self.source.clone();
        options.name = self.name.clone();
        options.provider = self.provider.clone();
        options.devcontainer_path = self.devcontainer_path.clone();
        options.workdir = self.workdir.clone();
        if self.inactivity_timeout.is_some() {
            options.inactivity_timeout = self.inactivity_timeout;
        }
        options
    }
}

/// Create or resume a workspace.
#[derive(Args, Debug)]
pub struct UpCmd {
    #[command(flatten)]
    pub args: UpArgs,
}

impl UpCmd {
    pub fn run(self, config: &KledConfig) -> kled::Result<()> {
        let options = self.args.options(config);
        let orchestrator = orchestrator(config);

        block_on(async move {
            let session = orchestrator
                .up(options, |stage, message| eprintln!("[{}] {}", stage, message))
                .await?;
            for warning in session.warnings() {
                eprintln!("warning: {}", warning);
            }
            let workspace = session.workspace().clone();
            session.close().await?;

            println!("Workspace {} is ready", workspace.name);
            if let Some(container) = &workspace.container_id {
                println!("  container: {}", container);
            }
            if let Some(image) = &workspace.image {
                println!("  image:     {}", image);
            }
            println!("Connect with: kled workspace ssh {} --stdio", workspace.name);
            Ok::<(), kled::Error>(())
        })?
    }
}

/// Open an SSH session to the workspace.
#[derive(Args, Debug)]
pub struct SshCmd {
    /// Workspace name
    pub name: String,

    /// Bridge the session to stdin/stdout (for `ssh -o ProxyCommand`)
    #[arg(long)]
    pub stdio: bool,
}

impl SshCmd {
    pub fn run(self, config: &KledConfig) -> kled::Result<()> {
        if !self.stdio {
            return Err(kled::Error::config(format!(
                "use `ssh -o ProxyCommand='kled workspace ssh {} --stdio' {}`",
                self.name, self.name
            )));
        }
        let mut options = UpOptions::from_env(config);
        options.name = Some(self.name.clone());
        let orchestrator = orchestrator(config);

        block_on(async move {
            let session = orchestrator
                .up(options, |stage, message| {
                    tracing::info!(%stage, %message, "progress")
                })
                .await?;
            let channel = session.open_ssh().await?;
            let bridged =
                kled_protocol::bridge(channel, tokio::io::stdin(), tokio::io::stdout()).await;
            session.close().await?;
            bridged.map_err(kled::Error::from)
        })?
    }
}

fn list(config: &KledConfig) -> kled::Result<()> {
    let workspaces = orchestrator(config).list()?;
    if workspaces.is_empty() {
        println!("No workspaces");
        return Ok(());
    }
    println!(
        "{:<24} {:<12} {:<24} SOURCE",
        "NAME", "PROVIDER", "MACHINE"
    );
    for ws in workspaces {
        println!(
            "{:<24} {:<12} {:<24} {}",
            ws.name,
            ws.provider,
            ws.machine_id.as_deref().unwrap_or("-"),
            ws.source.display_string()
        );
    }
    Ok(())
}
