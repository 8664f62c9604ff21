//! In-process fakes for driving a full `up` without docker or a machine.
//!
//! The host and container agents are the real ones; they talk over tokio
//! duplex pipes instead of spawned processes.

#![allow(dead_code)]

use async_trait::async_trait;
use kled::agent::{AgentLauncher, HostAgent, HostOptions, Transport};
use kled::build::BuildCoordinator;
use kled::config::KledConfig;
use kled::credentials::CredentialSource;
use kled::error::{ProviderError, ProviderErrorKind};
use kled::orchestrator::{HostConnector, Orchestrator};
use kled::provider::{
    MachineDescriptor, MachineState, Provider, ProviderController, ProviderRegistry, RetryPolicy,
};
use kled::runtime::{BuildRequest, ContainerRuntime, ContainerState, ContainerStatus, RunSpec};
use kled::workspace::WorkspaceStore;
use kled_agent::paths::AgentPaths;
use kled_agent::ContainerAgent;
use kled_protocol::{CredentialRequest, CredentialResponse, GitCredentials, WorkspaceInfo};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "fake";

const PIPE_SIZE: usize = 256 * 1024;

// ============================================================================
// Provider
// ============================================================================

/// A machine that lives in memory.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<MachineState>,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Start calls left to fail with a transient error.
    pub flaky_starts: AtomicU32,
}

impl FakeProvider {
    pub fn state(&self) -> MachineState {
        *self.state.lock()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn create(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = MachineState::Stopped;
        Ok(())
    }

    async fn start(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        let flaky = self.flaky_starts.load(Ordering::SeqCst);
        if flaky > 0 {
            self.flaky_starts.store(flaky - 1, Ordering::SeqCst);
            return Err(ProviderError::new(
                PROVIDER,
                "start",
                ProviderErrorKind::Transient,
                "connection reset",
            ));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = MachineState::Running;
        Ok(())
    }

    async fn stop(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = MachineState::Stopped;
        Ok(())
    }

    async fn delete(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        *self.state.lock() = MachineState::NotExist;
        Ok(())
    }

    async fn status(&self, _machine: &MachineDescriptor) -> Result<MachineState, ProviderError> {
        Ok(*self.state.lock())
    }

    fn exec_command(
        &self,
        _machine: &MachineDescriptor,
        command: &[String],
    ) -> Result<Vec<String>, ProviderError> {
        Ok(command.to_vec())
    }
}

// ============================================================================
// Container runtime
// ============================================================================

#[derive(Default)]
struct RuntimeState {
    images: HashSet<String>,
    /// Keyed by workspace ID.
    containers: HashMap<String, ContainerStatus>,
    next_id: usize,
}

/// Containers and images in memory; builds are counted.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    pub builds: AtomicUsize,
    pub creates: AtomicUsize,
}

impl FakeRuntime {
    pub fn container(&self, workspace_id: &str) -> Option<ContainerStatus> {
        self.state.lock().containers.get(workspace_id).cloned()
    }

    fn set_state(&self, id: &str, state: ContainerState) -> kled::Result<()> {
        let mut guard = self.state.lock();
        let container = guard
            .containers
            .values_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| kled::Error::runtime(format!("no such container: {}", id)))?;
        container.state = state;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> kled::Result<()> {
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> kled::Result<bool> {
        Ok(self.state.lock().images.contains(reference))
    }

    async fn pull(&self, reference: &str) -> kled::Result<()> {
        self.state.lock().images.insert(reference.to_string());
        Ok(())
    }

    async fn build(&self, request: &BuildRequest) -> kled::Result<String> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.state.lock().images.insert(request.tag.clone());
        Ok(format!("built {}\n", request.tag))
    }

    async fn find(&self, workspace_id: &str) -> kled::Result<Option<ContainerStatus>> {
        Ok(self.container(workspace_id))
    }

    async fn create(&self, spec: &RunSpec) -> kled::Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.state.lock();
        guard.next_id += 1;
        let id = format!("c{}", guard.next_id);
        guard.containers.insert(
            spec.workspace_id.clone(),
            ContainerStatus {
                id: id.clone(),
                image: spec.image.clone(),
                state: ContainerState::Stopped,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> kled::Result<()> {
        self.set_state(id, ContainerState::Running)
    }

    async fn stop(&self, id: &str) -> kled::Result<()> {
        self.set_state(id, ContainerState::Stopped)
    }

    async fn remove(&self, id: &str) -> kled::Result<()> {
        self.state.lock().containers.retain(|_, c| c.id != id);
        Ok(())
    }

    async fn copy_into(&self, _id: &str, _source: &Path, _dest: &str) -> kled::Result<()> {
        Ok(())
    }

    fn exec_command(&self, _id: &str, _user: Option<&str>, command: &[String]) -> Vec<String> {
        command.to_vec()
    }
}

// ============================================================================
// Hops
// ============================================================================

fn info_arg(command: &[String]) -> kled::Result<WorkspaceInfo> {
    let arg = command
        .iter()
        .position(|a| a == "--workspace-info")
        .and_then(|i| command.get(i + 1))
        .ok_or_else(|| kled::Error::runtime("hop command has no --workspace-info"))?;
    Ok(WorkspaceInfo::from_arg(arg)?)
}

/// Runs the container agent in-process. SSH sessions are served by `cat`.
pub struct InProcessLauncher {
    root: PathBuf,
    credentials_port: Option<u16>,
}

#[async_trait]
impl AgentLauncher for InProcessLauncher {
    async fn launch(
        &self,
        _container_id: &str,
        _user: Option<&str>,
        command: &[String],
    ) -> kled::Result<Transport> {
        let mut info = info_arg(command)?;
        info.ssh_server_command = Some(vec!["cat".to_string()]);
        info.credentials_port = self.credentials_port;

        let home = self.root.join("home");
        std::fs::create_dir_all(&home)?;
        let paths = AgentPaths::new(self.root.join("agent"), self.root.join("bin"));
        let agent = ContainerAgent::new(info, paths)
            .with_exe(self.root.join("bin").join("kled"))
            .with_home(home);

        let (host_side, agent_side) = tokio::io::duplex(PIPE_SIZE);
        let (reader, writer) = tokio::io::split(agent_side);
        tokio::spawn(async move {
            if let Err(e) = agent.run(reader, writer).await {
                tracing::debug!(error = %e, "container agent exited");
            }
        });
        let (reader, writer) = tokio::io::split(host_side);
        Ok(Transport::new(reader, writer))
    }
}

/// Runs the host agent in-process against the fake runtime.
pub struct InProcessConnector {
    runtime: Arc<FakeRuntime>,
    builder: Arc<BuildCoordinator>,
    launcher: Arc<InProcessLauncher>,
    options: HostOptions,
}

impl InProcessConnector {
    fn host(&self, command: &[String]) -> kled::Result<HostAgent> {
        Ok(HostAgent::new(
            info_arg(command)?,
            self.runtime.clone(),
            self.builder.clone(),
            self.launcher.clone(),
            self.options.clone(),
        ))
    }
}

#[async_trait]
impl HostConnector for InProcessConnector {
    async fn connect(&self, _machine: &MachineDescriptor, command: &[String]) -> kled::Result<Transport> {
        let host = self.host(command)?;
        let (client_side, host_side) = tokio::io::duplex(PIPE_SIZE);
        let (reader, writer) = tokio::io::split(host_side);
        tokio::spawn(async move {
            if let Err(e) = host.run(reader, writer).await {
                tracing::debug!(error = %e, "host agent exited");
            }
        });
        let (reader, writer) = tokio::io::split(client_side);
        Ok(Transport::new(reader, writer))
    }

    async fn run(&self, _machine: &MachineDescriptor, command: &[String]) -> kled::Result<String> {
        let host = self.host(command)?;
        match command.get(3).map(String::as_str) {
            Some("build") => Ok(host.build().await?.log.unwrap_or_default()),
            Some("stop") => host.stop().await.map(|_| String::new()),
            Some("delete") => host.delete().await.map(|_| String::new()),
            other => Err(kled::Error::runtime(format!("unexpected hop op: {:?}", other))),
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Answers git requests with a fixed token and counts requests by kind.
#[derive(Default)]
pub struct CountingCredentials {
    pub git: AtomicUsize,
    pub docker: AtomicUsize,
    pub signatures: AtomicUsize,
}

#[async_trait]
impl CredentialSource for CountingCredentials {
    async fn resolve(&self, request: &CredentialRequest) -> CredentialResponse {
        match request {
            CredentialRequest::Git { query } => {
                self.git.fetch_add(1, Ordering::SeqCst);
                CredentialResponse::Git {
                    credentials: GitCredentials {
                        username: Some("kled".into()),
                        password: Some("token".into()),
                        ..query.clone()
                    },
                }
            }
            CredentialRequest::Docker { .. } | CredentialRequest::DockerList => {
                self.docker.fetch_add(1, Ordering::SeqCst);
                CredentialResponse::NotFound
            }
            CredentialRequest::SshSignature { .. } => {
                self.signatures.fetch_add(1, Ordering::SeqCst);
                CredentialResponse::NotFound
            }
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A client, machine and container wired together in one process.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub provider: Arc<FakeProvider>,
    pub runtime: Arc<FakeRuntime>,
    pub credentials: Arc<CountingCredentials>,
    pub orchestrator: Orchestrator,
}

#[derive(Default)]
pub struct HarnessOptions {
    pub flaky_starts: u32,
    pub credentials_port: Option<u16>,
    pub keep_running: bool,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::default());
        provider
            .flaky_starts
            .store(options.flaky_starts, Ordering::SeqCst);
        let runtime = Arc::new(FakeRuntime::default());
        let credentials = Arc::new(CountingCredentials::default());

        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let retry = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            max_attempts: 5,
        };
        let controller = ProviderController::new(Arc::new(registry), retry);

        let launcher = Arc::new(InProcessLauncher {
            root: dir.path().join("container"),
            credentials_port: options.credentials_port,
        });
        let connector = InProcessConnector {
            runtime: runtime.clone(),
            builder: Arc::new(BuildCoordinator::new(runtime.clone())),
            launcher,
            options: HostOptions::new(dir.path().join("host")),
        };

        let mut config = KledConfig::default();
        config.default_provider = PROVIDER.to_string();
        config.agent.keep_running = options.keep_running;
        let orchestrator = Orchestrator::new(
            config,
            WorkspaceStore::new(dir.path().join("client")),
            controller,
            Arc::new(connector),
            credentials.clone(),
        );

        Self {
            dir,
            provider,
            runtime,
            credentials,
            orchestrator,
        }
    }

    /// A local workspace source with a Dockerfile and the given
    /// devcontainer.json.
    pub fn source(&self, devcontainer: &str) -> PathBuf {
        let source = self.dir.path().join("project");
        std::fs::create_dir_all(source.join(".devcontainer")).unwrap();
        std::fs::write(source.join(".devcontainer/Dockerfile"), "FROM alpine:3.19\n").unwrap();
        std::fs::write(source.join(".devcontainer/devcontainer.json"), devcontainer).unwrap();
        source
    }

    /// Where hook commands in these tests append their output.
    pub fn hook_log(&self) -> PathBuf {
        self.dir.path().join("hooks.log")
    }

    pub fn hook_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.hook_log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// A port on 127.0.0.1 that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
