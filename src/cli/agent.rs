//! Agent hops.
//!
//! Not meant to be run by hand:
//! - `agent workspace ...` is the host agent, started on the machine by the
//!   client with its stdio as the transport
//! - `agent daemon` is the machine inactivity daemon
//! - `agent container ...` runs inside the workspace container
//! - `agent git-credentials`, `docker-credentials` and `git-ssh-signature`
//!   are the credential helpers installed in the container

use clap::{Args, Subcommand};
use kled::agent::daemon::{run_host_daemon, HostDaemonOptions};
use kled::agent::{HostAgent, HostOptions, HostPaths, RuntimeLauncher};
use kled::build::BuildCoordinator;
use kled::config::KledConfig;
use kled::runtime::{ContainerRuntime, DockerRuntime};
use kled_agent::credentials::{parse_sign_args, sign_file, HelperClient};
use kled_agent::daemon::{run_daemon, DaemonOptions};
use kled_agent::paths::{credentials_port_from_env, AgentPaths};
use kled_agent::platform::PlatformLogin;
use kled_agent::ContainerAgent;
use kled_protocol::{ForwardingFeatures, WorkspaceInfo};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{block_on, parse_duration};

fn parse_workspace_info(s: &str) -> Result<WorkspaceInfo, String> {
    WorkspaceInfo::from_arg(s).map_err(|e| format!("invalid workspace info: {}", e))
}

/// Agent hops
#[derive(Subcommand, Debug)]
pub enum AgentCmd {
    /// Host agent operations on the machine
    #[command(subcommand)]
    Workspace(WorkspaceAgentCmd),

    /// Machine inactivity daemon
    Daemon(HostDaemonCmd),

    /// Container agent operations
    #[command(subcommand)]
    Container(ContainerAgentCmd),

    /// Git credential helper
    GitCredentials(GitCredentialsCmd),

    /// Docker credential helper
    DockerCredentials(DockerCredentialsCmd),

    /// `gpg.ssh.program` replacement forwarding signatures
    GitSshSignature(GitSshSignatureCmd),
}

impl AgentCmd {
    pub fn is_daemon(&self) -> bool {
        matches!(
            self,
            AgentCmd::Daemon(_) | AgentCmd::Container(ContainerAgentCmd::Daemon(_))
        )
    }

    pub fn run(self, config: &KledConfig) -> kled::Result<()> {
        match self {
            AgentCmd::Workspace(cmd) => cmd.run(config),
            AgentCmd::Daemon(cmd) => cmd.run(config),
            AgentCmd::Container(cmd) => cmd.run(),
            AgentCmd::GitCredentials(cmd) => cmd.run(),
            AgentCmd::DockerCredentials(cmd) => cmd.run(),
            AgentCmd::GitSshSignature(cmd) => cmd.run(),
        }
    }
}

// ============================================================================
// Host agent
// ============================================================================

/// Host agent operations
#[derive(Subcommand, Debug)]
pub enum WorkspaceAgentCmd {
    /// Bring the workspace up and relay sessions over stdio
    Up(WorkspaceInfoArg),

    /// Build the workspace image; prints the build log
    Build(WorkspaceInfoArg),

    /// Stop the workspace container
    Stop(WorkspaceInfoArg),

    /// Remove the workspace container and its machine state
    Delete(WorkspaceInfoArg),
}

#[derive(Args, Debug)]
pub struct WorkspaceInfoArg {
    /// Serialized workspace description
    #[arg(long, value_parser = parse_workspace_info)]
    pub workspace_info: WorkspaceInfo,
}

impl WorkspaceAgentCmd {
    pub fn run(self, config: &KledConfig) -> kled::Result<()> {
        let exe = std::env::current_exe().ok();
        let mut options = HostOptions::new(config.agent_data_dir());
        options.agent_binary = exe.clone();
        options.container_agent_path = config.agent.container_path.clone();
        options.daemon_exe = exe;
        options.shutdown_command = config.agent.shutdown_command.clone();

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::default());
        let builder = Arc::new(
            BuildCoordinator::new(runtime.clone()).with_lock_dir(options.paths.build_locks()),
        );
        let launcher = Arc::new(RuntimeLauncher::new(runtime.clone()));
        let host = |info: WorkspaceInfo| {
            HostAgent::new(info, runtime.clone(), builder.clone(), launcher.clone(), options.clone())
        };

        block_on(async move {
            match self {
                WorkspaceAgentCmd::Up(arg) => {
                    host(arg.workspace_info)
                        .run(tokio::io::stdin(), tokio::io::stdout())
                        .await
                }
                WorkspaceAgentCmd::Build(arg) => {
                    let image = host(arg.workspace_info).build().await?;
                    if let Some(log) = &image.log {
                        print!("{}", log);
                    }
                    println!("{}", image.reference);
                    Ok(())
                }
                WorkspaceAgentCmd::Stop(arg) => host(arg.workspace_info).stop().await,
                WorkspaceAgentCmd::Delete(arg) => host(arg.workspace_info).delete().await,
            }
        })?
    }
}

/// Run the machine inactivity daemon.
#[derive(Args, Debug)]
pub struct HostDaemonCmd {
    /// Idle time before the machine is shut down
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Duration,

    /// Host agent state directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl HostDaemonCmd {
    pub fn run(self, config: &KledConfig) -> kled::Result<()> {
        let data_dir = self.data_dir.unwrap_or_else(|| config.agent_data_dir());
        let mut options = HostDaemonOptions::new(HostPaths::new(data_dir), self.timeout);
        options.poll_interval = config.inactivity.poll_interval;
        options.busy_grace = config.inactivity.busy_grace;
        options.keep_running = config.agent.keep_running;
        options.shutdown_command = config.agent.shutdown_command.clone();

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::default());
        block_on(run_host_daemon(options, runtime))?
    }
}

// ============================================================================
// Container agent
// ============================================================================

/// Container agent operations
#[derive(Subcommand, Debug)]
pub enum ContainerAgentCmd {
    /// Set the container up and serve SSH sessions over stdio
    Setup(WorkspaceInfoArg),

    /// Serve the credentials API, forwarding over stdio
    CredentialsServer(CredentialsServerCmd),

    /// Container inactivity daemon
    Daemon(ContainerDaemonCmd),

    /// Log the container in to the managed platform
    SetupLoftPlatformAccess(WorkspaceInfoArg),
}

impl ContainerAgentCmd {
    pub fn run(self) -> kled::Result<()> {
        let paths = AgentPaths::from_env();
        match self {
            ContainerAgentCmd::Setup(arg) => {
                let agent = ContainerAgent::new(arg.workspace_info, paths);
                block_on(agent.run(tokio::io::stdin(), tokio::io::stdout()))??;
                Ok(())
            }
            ContainerAgentCmd::CredentialsServer(cmd) => {
                let port = cmd.port.unwrap_or_else(credentials_port_from_env);
                block_on(kled_agent::run_credentials_server(
                    tokio::io::stdin(),
                    tokio::io::stdout(),
                    ForwardingFeatures::from_env(),
                    port,
                ))??;
                Ok(())
            }
            ContainerAgentCmd::Daemon(cmd) => {
                let mut options = DaemonOptions::new(paths, cmd.timeout);
                options.shutdown_command = cmd.shutdown_command;
                block_on(run_daemon(options))??;
                Ok(())
            }
            ContainerAgentCmd::SetupLoftPlatformAccess(arg) => {
                let Some(access) = arg.workspace_info.platform else {
                    tracing::debug!("no platform access configured");
                    return Ok(());
                };
                let exe = std::env::current_exe()?;
                block_on(PlatformLogin::new(exe).run(&access))??;
                Ok(())
            }
        }
    }
}

#[derive(Args, Debug)]
pub struct CredentialsServerCmd {
    /// Port on 127.0.0.1
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Args, Debug)]
pub struct ContainerDaemonCmd {
    /// Idle time before the container is stopped
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Duration,

    /// Run this instead of stopping the container
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub shutdown_command: Option<Vec<String>>,
}

// ============================================================================
// Credential helpers
// ============================================================================

fn read_stdin() -> String {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        tracing::debug!(error = %e, "failed to read helper input");
    }
    input
}

fn helper_client(port: Option<u16>) -> Option<HelperClient> {
    let port = port.unwrap_or_else(credentials_port_from_env);
    match HelperClient::new(port) {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::debug!(error = %e, "credentials client unavailable");
            None
        }
    }
}

/// Print helper output. Failures print nothing so the calling tool falls
/// back to its own behavior.
fn emit(output: Option<String>) -> kled::Result<()> {
    if let Some(output) = output {
        let mut stdout = std::io::stdout();
        stdout.write_all(output.as_bytes())?;
        stdout.flush()?;
    }
    Ok(())
}

/// Git credential helper (`get`, `store`, `erase`).
#[derive(Args, Debug)]
pub struct GitCredentialsCmd {
    /// Credentials server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Operation requested by git
    pub operation: String,
}

impl GitCredentialsCmd {
    pub fn run(self) -> kled::Result<()> {
        let input = read_stdin();
        emit(helper_client(self.port).and_then(|client| client.git(&self.operation, &input)))
    }
}

/// Docker credential helper (`get`, `list`).
#[derive(Args, Debug)]
pub struct DockerCredentialsCmd {
    /// Credentials server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Operation requested by docker
    pub operation: String,
}

impl DockerCredentialsCmd {
    pub fn run(self) -> kled::Result<()> {
        let input = if self.operation == "get" {
            read_stdin()
        } else {
            String::new()
        };
        emit(helper_client(self.port).and_then(|client| client.docker(&self.operation, &input)))
    }
}

/// Signs like `ssh-keygen -Y sign`, with the key held on the user's machine.
#[derive(Args, Debug)]
pub struct GitSshSignatureCmd {
    /// Credentials server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Arguments as git passes them to `gpg.ssh.program`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl GitSshSignatureCmd {
    pub fn run(self) -> kled::Result<()> {
        let Some(args) = parse_sign_args(&self.args) else {
            return Err(kled::Error::config(format!(
                "unsupported ssh-keygen invocation: {}",
                self.args.join(" ")
            )));
        };
        let port = self.port.unwrap_or_else(credentials_port_from_env);
        let client = HelperClient::new(port)?;
        sign_file(&client, &args)?;
        Ok(())
    }
}
