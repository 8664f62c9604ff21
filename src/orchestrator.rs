//! Client orchestrator.
//!
//! Sequences a workspace `up`: machine via the provider controller, then
//! the host agent hop on the machine, which builds, starts and bootstraps
//! the container. The resulting [`Session`] carries SSH channels and
//! control requests until it is closed.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kled_protocol::{
    channels, info::ENV_EXIT_AFTER_TIMEOUT, AgentRequest, AgentResponse, Channel,
    ForwardingFeatures, MessageChannel, Mux, Role, WorkspaceInfo, WorkspaceSource,
};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{reap, Transport, EXIT_GRACE};
use crate::config::KledConfig;
use crate::credentials::{serve_credentials, CredentialSource};
use crate::error::{Error, Result};
use crate::provider::{MachineDescriptor, MachineState, ProviderController, ProviderRegistry};
use crate::workspace::{WorkspaceDescriptor, WorkspaceStore};

/// Name of the host agent hop in error reports.
const HOST_HOP: &str = "host agent";

/// Runs commands on a machine.
#[async_trait]
pub trait HostConnector: Send + Sync {
    /// Start `command` on the machine with its stdio as the transport.
    async fn connect(&self, machine: &MachineDescriptor, command: &[String]) -> Result<Transport>;

    /// Run `command` on the machine to completion and return its stdout.
    async fn run(&self, machine: &MachineDescriptor, command: &[String]) -> Result<String>;
}

/// Connects through each provider's exec command.
pub struct ProviderConnector {
    registry: Arc<ProviderRegistry>,
}

impl ProviderConnector {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    fn argv(&self, machine: &MachineDescriptor, command: &[String]) -> Result<Vec<String>> {
        let provider = self.registry.get(&machine.provider)?;
        Ok(provider.exec_command(machine, command)?)
    }
}

#[async_trait]
impl HostConnector for ProviderConnector {
    async fn connect(&self, machine: &MachineDescriptor, command: &[String]) -> Result<Transport> {
        Transport::spawn(&self.argv(machine, command)?)
    }

    async fn run(&self, machine: &MachineDescriptor, command: &[String]) -> Result<String> {
        let argv = self.argv(machine, command)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::runtime("provider returned an empty exec command"))?;
        debug!(?argv, "running on machine");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::runtime(format!("failed to start {}: {}", program, e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(Error::bootstrap(
                HOST_HOP,
                format!("{} exited with {}", command.join(" "), output.status),
            ));
        }
        Ok(stdout)
    }
}

/// Inactivity timeout requested through `EXIT_AFTER_TIMEOUT`.
///
/// A duration (`"30m"`) or bare seconds set the timeout; a truthy or
/// unparsable value enables the configured default. Unset or falsy values
/// disable it.
pub fn inactivity_timeout_from_env(
    value: Option<&str>,
    config: &KledConfig,
) -> Option<Duration> {
    let value = value?.trim();
    match value.to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => return None,
        "1" | "true" | "yes" | "on" => return Some(config.inactivity.timeout),
        _ => {}
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    match humantime::parse_duration(value) {
        Ok(timeout) => Some(timeout),
        Err(_) => Some(config.inactivity.timeout),
    }
}

/// Options for [`Orchestrator::up`].
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Source string for a new workspace; ignored when `name` exists.
    pub source: Option<String>,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub devcontainer_path: Option<String>,
    pub features: ForwardingFeatures,
    pub inactivity_timeout: Option<Duration>,
    pub workdir: Option<PathBuf>,
}

impl UpOptions {
    /// Options with the forwarding switches and timeout read from the
    /// environment.
    pub fn from_env(config: &KledConfig) -> Self {
        Self {
            features: ForwardingFeatures::from_env(),
            inactivity_timeout: inactivity_timeout_from_env(
                std::env::var(ENV_EXIT_AFTER_TIMEOUT).ok().as_deref(),
                config,
            ),
            ..Default::default()
        }
    }
}

/// Drives workspaces from the client.
pub struct Orchestrator {
    config: KledConfig,
    store: WorkspaceStore,
    controller: ProviderController,
    connector: Arc<dyn HostConnector>,
    credentials: Arc<dyn CredentialSource>,
}

impl Orchestrator {
    pub fn new(
        config: KledConfig,
        store: WorkspaceStore,
        controller: ProviderController,
        connector: Arc<dyn HostConnector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            config,
            store,
            controller,
            connector,
            credentials,
        }
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    pub fn controller(&self) -> &ProviderController {
        &self.controller
    }

    // =========================================================================
    // Workspace up
    // =========================================================================

    /// Bring a workspace up and return the live session.
    ///
    /// `on_progress` receives the inner hops' progress reports.
    pub async fn up<F>(&self, options: UpOptions, on_progress: F) -> Result<Session>
    where
        F: Fn(&str, &str) + Send + Sync,
    {
        let mut workspace = self.resolve_workspace(&options)?;
        info!(workspace = %workspace.id, provider = %workspace.provider, "bringing workspace up");

        let machine = self.ensure_machine(&mut workspace).await?;
        let info = self.workspace_info(&workspace, &options)?;
        let command = self.agent_command(&machine, "up", &info)?;

        let transport = self.connector.connect(&machine, &command).await?;
        let (reader, writer, child) = transport.into_parts();
        let (mux, control) = Mux::new(reader, writer, Role::Initiator);
        let mut control = MessageChannel::new(control);
        let credentials = tokio::spawn(serve_credentials(
            mux.clone(),
            options.features,
            self.credentials.clone(),
        ));

        let ready = match wait_ready(&mut control, &on_progress).await {
            Ok(ready) => ready,
            Err(e) => {
                mux.shutdown();
                credentials.abort();
                reap(child, EXIT_GRACE).await;
                return Err(e);
            }
        };

        workspace.container_id = Some(ready.container_id.clone());
        workspace.image = Some(ready.image.clone());
        workspace.touch();
        self.store.save_workspace(&workspace)?;
        for warning in &ready.warnings {
            warn!(workspace = %workspace.id, "{}", warning);
        }
        info!(workspace = %workspace.id, container = %ready.container_id, "workspace ready");

        Ok(Session {
            workspace,
            warnings: ready.warnings,
            mux,
            control,
            child,
            credentials,
        })
    }

    fn resolve_workspace(&self, options: &UpOptions) -> Result<WorkspaceDescriptor> {
        let existing = match &options.name {
            Some(name) => self.store.load_workspace(name)?,
            None => None,
        };
        let mut workspace = match (existing, &options.source) {
            (Some(workspace), _) => workspace,
            (None, Some(source)) => {
                let provider = options
                    .provider
                    .as_deref()
                    .unwrap_or(&self.config.default_provider);
                self.controller.registry().get(provider)?;
                let workspace =
                    WorkspaceDescriptor::new(source, options.name.as_deref(), provider)?;
                match self.store.load_workspace(&workspace.name)? {
                    Some(known) => known,
                    None => workspace,
                }
            }
            (None, None) => {
                return Err(match &options.name {
                    Some(name) => Error::WorkspaceNotFound(name.clone()),
                    None => Error::config("a workspace source or name is required"),
                })
            }
        };
        if options.devcontainer_path.is_some() {
            workspace.devcontainer_path = options.devcontainer_path.clone();
        }
        Ok(workspace)
    }

    async fn ensure_machine(&self, workspace: &mut WorkspaceDescriptor) -> Result<MachineDescriptor> {
        let machine_id = workspace
            .machine_id
            .clone()
            .unwrap_or_else(|| workspace.id.clone());
        let machine = self
            .store
            .load_machine(&machine_id)?
            .unwrap_or_else(|| MachineDescriptor::new(&workspace.provider, &machine_id));

        let machine = self.controller.ensure_machine(&machine).await?;
        self.store.save_machine(&machine)?;
        workspace.machine_id = Some(machine.id.clone());
        self.store.save_workspace(workspace)?;
        Ok(machine)
    }

    fn workspace_info(
        &self,
        workspace: &WorkspaceDescriptor,
        options: &UpOptions,
    ) -> Result<WorkspaceInfo> {
        let source = match &workspace.source {
            WorkspaceSource::Local { path } => WorkspaceSource::Local {
                path: std::fs::canonicalize(path).map_err(|e| {
                    Error::config(format!("workspace folder {}: {}", path.display(), e))
                })?,
            },
            other => other.clone(),
        };

        let mut info = WorkspaceInfo::new(&workspace.id, source);
        info.name = workspace.name.clone();
        info.machine_id = workspace.machine_id.clone();
        info.devcontainer_path = workspace.devcontainer_path.clone();
        info.features = options.features;
        info.inactivity_timeout_secs = options.inactivity_timeout.map(|t| t.as_secs().max(1));
        info.platform = self.config.platform.clone();
        info.workdir = options.workdir.clone();
        info.session_mode = self.config.agent.session_mode;
        info.keep_running = self.config.agent.keep_running;
        info.cleanup_on_cancel = self.config.agent.cleanup_on_cancel;
        Ok(info)
    }

    /// `kled agent workspace <op> --workspace-info <json>` on the machine.
    fn agent_command(
        &self,
        machine: &MachineDescriptor,
        op: &str,
        info: &WorkspaceInfo,
    ) -> Result<Vec<String>> {
        let provider = self.controller.registry().get(&machine.provider)?;
        let binary = if provider.is_local() {
            std::env::current_exe()?.display().to_string()
        } else {
            self.config.agent.path.clone()
        };
        Ok(vec![
            binary,
            "agent".to_string(),
            "workspace".to_string(),
            op.to_string(),
            "--workspace-info".to_string(),
            info.to_arg()?,
        ])
    }

    // =========================================================================
    // One-shot operations
    // =========================================================================

    /// Build the workspace image on its machine. Returns the build output.
    pub async fn build(&self, name: &str) -> Result<String> {
        let mut workspace = self.store.workspace(name)?;
        let machine = self.ensure_machine(&mut workspace).await?;
        let info = self.workspace_info(&workspace, &UpOptions::default())?;
        let command = self.agent_command(&machine, "build", &info)?;
        self.connector.run(&machine, &command).await
    }

    /// Stop the workspace container, then its machine unless another
    /// workspace shares it. With `agent.keep_running` both are left up.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let workspace = self.store.workspace(name)?;
        if self.config.agent.keep_running {
            info!(workspace = %workspace.id, "keep_running set, leaving workspace up");
            return Ok(());
        }
        let Some(machine) = self.machine_of(&workspace)? else {
            return Ok(());
        };
        let state = self.controller.status(&machine).await?;
        if state != MachineState::Running {
            debug!(workspace = %workspace.id, %state, "machine not running, nothing to stop");
            return Ok(());
        }

        let info = self.workspace_info(&workspace, &UpOptions::default())?;
        let command = self.agent_command(&machine, "stop", &info)?;
        self.connector.run(&machine, &command).await?;

        if !self.shares_machine(&workspace, &machine)? {
            let machine = self.controller.stop_machine(&machine).await?;
            self.store.save_machine(&machine)?;
        }
        Ok(())
    }

    /// Remove the workspace container, its machine and the local state.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let workspace = self.store.workspace(name)?;
        if let Some(machine) = self.machine_of(&workspace)? {
            if self.controller.status(&machine).await? == MachineState::Running {
                let info = self.workspace_info(&workspace, &UpOptions::default())?;
                let command = self.agent_command(&machine, "delete", &info)?;
                self.connector.run(&machine, &command).await?;
            }
            if !self.shares_machine(&workspace, &machine)? {
                self.controller.delete_machine(&machine).await?;
                self.store.delete_machine(&machine.id)?;
            }
        }
        self.store.delete_workspace(&workspace.name)?;
        info!(workspace = %workspace.id, "workspace deleted");
        Ok(())
    }

    /// Machine state of a workspace.
    pub async fn status(&self, name: &str) -> Result<MachineState> {
        let workspace = self.store.workspace(name)?;
        match self.machine_of(&workspace)? {
            Some(machine) => self.controller.status(&machine).await,
            None => Ok(MachineState::NotExist),
        }
    }

    pub fn list(&self) -> Result<Vec<WorkspaceDescriptor>> {
        self.store.list_workspaces()
    }

    fn machine_of(&self, workspace: &WorkspaceDescriptor) -> Result<Option<MachineDescriptor>> {
        match &workspace.machine_id {
            Some(id) => self.store.load_machine(id),
            None => Ok(None),
        }
    }

    /// Whether another workspace runs on `machine`.
    fn shares_machine(
        &self,
        workspace: &WorkspaceDescriptor,
        machine: &MachineDescriptor,
    ) -> Result<bool> {
        Ok(self.store.list_workspaces()?.iter().any(|other| {
            other.name != workspace.name && other.machine_id.as_deref() == Some(machine.id.as_str())
        }))
    }
}

struct ReadyReport {
    container_id: String,
    image: String,
    warnings: Vec<String>,
}

async fn wait_ready<F>(control: &mut MessageChannel, on_progress: &F) -> Result<ReadyReport>
where
    F: Fn(&str, &str),
{
    loop {
        match control.recv::<AgentResponse>().await? {
            Some(AgentResponse::Progress { stage, message }) => {
                debug!(%stage, %message, "progress");
                on_progress(&stage, &message);
            }
            Some(AgentResponse::Ready {
                container_id,
                image,
                warnings,
            }) => {
                return Ok(ReadyReport {
                    container_id,
                    image,
                    warnings,
                })
            }
            Some(AgentResponse::Error { message, code }) => {
                return Err(Error::from_wire(HOST_HOP, code.as_deref(), message))
            }
            Some(other) => debug!(response = ?other, "ignoring response before ready"),
            None => {
                return Err(Error::Transport(format!(
                    "{} closed the transport before ready",
                    HOST_HOP
                )))
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A workspace that reported ready, with its transport still open.
pub struct Session {
    workspace: WorkspaceDescriptor,
    warnings: Vec<String>,
    mux: Mux,
    control: MessageChannel,
    child: Option<Child>,
    credentials: JoinHandle<()>,
}

impl Session {
    pub fn workspace(&self) -> &WorkspaceDescriptor {
        &self.workspace
    }

    /// Non-fatal problems reported during bring-up (failed optional hooks).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Open an SSH session channel to the container's SSH server.
    pub async fn open_ssh(&self) -> Result<Channel> {
        Ok(self.mux.open(channels::SSH).await?)
    }

    /// Round-trip a ping through both hops. Returns the protocol version.
    pub async fn ping(&mut self) -> Result<u32> {
        match self.request(&AgentRequest::Ping).await? {
            AgentResponse::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Status of the host agent and container agent.
    pub async fn status(&mut self) -> Result<serde_json::Value> {
        match self.request(&AgentRequest::Status).await? {
            AgentResponse::Ok { data } => Ok(data.unwrap_or(serde_json::Value::Null)),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&mut self, request: &AgentRequest) -> Result<AgentResponse> {
        self.control.send(request).await?;
        loop {
            match self.control.recv::<AgentResponse>().await? {
                Some(AgentResponse::Progress { .. }) => continue,
                Some(AgentResponse::Error { message, code }) => {
                    return Err(Error::from_wire(HOST_HOP, code.as_deref(), message))
                }
                Some(response) => return Ok(response),
                None => return Err(Error::Transport("transport closed".to_string())),
            }
        }
    }

    /// Resolves once the remote side closes the transport.
    pub async fn wait(&self) {
        self.mux.closed().await;
    }

    /// Ask the hops to shut down, then tear the transport down.
    pub async fn close(mut self) -> Result<()> {
        let result = match tokio::time::timeout(EXIT_GRACE, self.request(&AgentRequest::Shutdown))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(Error::Transport(_))) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!("shutdown not acknowledged in time");
                Ok(())
            }
        };
        if tokio::time::timeout(EXIT_GRACE, self.mux.finish()).await.is_err() {
            debug!("transport did not flush in time");
        }
        self.credentials.abort();
        reap(self.child.take(), EXIT_GRACE).await;
        result
    }
}

fn unexpected(response: AgentResponse) -> Error {
    Error::Transport(format!("unexpected response: {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactivity_timeout_from_env() {
        let config = KledConfig::default();
        assert_eq!(inactivity_timeout_from_env(None, &config), None);
        assert_eq!(inactivity_timeout_from_env(Some(""), &config), None);
        assert_eq!(inactivity_timeout_from_env(Some("false"), &config), None);
        assert_eq!(
            inactivity_timeout_from_env(Some("true"), &config),
            Some(config.inactivity.timeout)
        );
        assert_eq!(
            inactivity_timeout_from_env(Some("1"), &config),
            Some(config.inactivity.timeout)
        );
        assert_eq!(
            inactivity_timeout_from_env(Some("30m"), &config),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(
            inactivity_timeout_from_env(Some("90"), &config),
            Some(Duration::from_secs(90))
        );
    }
}
