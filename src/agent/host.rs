use async_trait::async_trait;
use kled_protocol::{
    channels, relay, AgentRequest, AgentResponse, Channel, ContainerSpec, HookSpec,
    MessageChannel, MountSpec, Mux, Role, WorkspaceInfo, WorkspaceSource, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tracing::{debug, info, warn};

use kled_agent::inactivity::{touch, BusyMarker, SessionTracker, DEFAULT_POLL_INTERVAL};
use kled_agent::process::Pidfile;

use super::{reap, source, HostPaths, Transport, EXIT_GRACE};
use crate::build::{BuildCoordinator, ImageRef};
use crate::devcontainer;
use crate::error::{Error, Result};
use crate::runtime::{ContainerDescriptor, ContainerRuntime, ContainerState, RunSpec};

/// Name this hop reports errors under.
const HOP: &str = "host agent";

/// Host agent lifecycle.
///
/// `Idle → ContainerStarting → ContainerReady → BootstrappingAgent → Ready`,
/// ending in `Closing` or `Faulted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Idle,
    ContainerStarting,
    ContainerReady,
    BootstrappingAgent,
    Ready,
    Closing,
    Faulted,
}

/// What the host agent keeps on disk per workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    pub info: WorkspaceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerDescriptor>,
}

/// Starts the container agent inside a container.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(
        &self,
        container_id: &str,
        user: Option<&str>,
        command: &[String],
    ) -> Result<Transport>;
}

/// Launches through the runtime's exec.
pub struct RuntimeLauncher {
    runtime: Arc<dyn ContainerRuntime>,
}

impl RuntimeLauncher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl AgentLauncher for RuntimeLauncher {
    async fn launch(
        &self,
        container_id: &str,
        user: Option<&str>,
        command: &[String],
    ) -> Result<Transport> {
        Transport::spawn(&self.runtime.exec_command(container_id, user, command))
    }
}

/// Host agent settings.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub paths: HostPaths,
    /// kled binary copied into the container. `None` when the image
    /// already ships it.
    pub agent_binary: Option<PathBuf>,
    /// Path of the kled binary inside the container.
    pub container_agent_path: String,
    /// Binary that runs the machine inactivity daemon. `None` disables it.
    pub daemon_exe: Option<PathBuf>,
    /// Machine-level command run on inactivity. When set, the host daemon
    /// owns the inactivity timeout instead of the container.
    pub shutdown_command: Vec<String>,
}

impl HostOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: HostPaths::new(data_dir),
            agent_binary: None,
            container_agent_path: "/usr/local/bin/kled".to_string(),
            daemon_exe: None,
            shutdown_command: Vec::new(),
        }
    }
}

/// The container agent hop once it reported ready.
struct Bootstrapped {
    mux: Mux,
    control: MessageChannel,
    child: Option<Child>,
    container_id: String,
    image: String,
    warnings: Vec<String>,
}

/// The host agent for one workspace session.
pub struct HostAgent {
    info: WorkspaceInfo,
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<BuildCoordinator>,
    launcher: Arc<dyn AgentLauncher>,
    options: HostOptions,
    state: Mutex<HostState>,
    /// Container created by this session, for cleanup on cancel.
    created: Mutex<Option<String>>,
}

impl HostAgent {
    pub fn new(
        info: WorkspaceInfo,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<BuildCoordinator>,
        launcher: Arc<dyn AgentLauncher>,
        options: HostOptions,
    ) -> Self {
        Self {
            info,
            runtime,
            builder,
            launcher,
            options,
            state: Mutex::new(HostState::Idle),
            created: Mutex::new(None),
        }
    }

    pub fn state(&self) -> HostState {
        *self.state.lock()
    }

    fn transition(&self, next: HostState) {
        let mut state = self.state.lock();
        let prev = *state;
        if prev != next {
            info!(workspace = %self.info.id, from = ?prev, to = ?next, "host agent state");
            *state = next;
        }
    }

    fn paths(&self) -> &HostPaths {
        &self.options.paths
    }

    fn host_daemon_enabled(&self) -> bool {
        self.info.inactivity_timeout_secs.is_some()
            && self.options.daemon_exe.is_some()
            && !self.options.shutdown_command.is_empty()
    }

    /// Bring the workspace up over `reader`/`writer`, then relay until the
    /// transport closes or upstream asks to shut down.
    ///
    /// Faults are reported upstream before returning the error.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (upstream, control) = Mux::new(reader, writer, Role::Acceptor);
        let mut control = MessageChannel::new(control);

        std::fs::create_dir_all(self.paths().workspace_dir(&self.info.id))?;
        let busy = BusyMarker::create(self.paths().busy_marker(&self.info.id));

        let outcome = tokio::select! {
            outcome = self.bring_up(&upstream, &control) => outcome,
            _ = upstream.closed() => Err(Error::Cancelled),
        };
        drop(busy);

        let inner = match outcome {
            Ok(inner) => inner,
            Err(Error::Cancelled) => {
                self.transition(HostState::Closing);
                self.cleanup_cancelled().await;
                return Err(Error::Cancelled);
            }
            Err(e) => {
                self.transition(HostState::Faulted);
                warn!(workspace = %self.info.id, error = %e, "bring-up failed");
                // the container is left for inspection
                let _ = control
                    .send(&AgentResponse::error(e.code(), e.hop_message(HOP)))
                    .await;
                close(&upstream).await;
                return Err(e);
            }
        };

        self.transition(HostState::Ready);
        control
            .send(&AgentResponse::Ready {
                container_id: inner.container_id.clone(),
                image: inner.image.clone(),
                warnings: inner.warnings.clone(),
            })
            .await?;
        self.mark_activity();
        if self.host_daemon_enabled() {
            self.ensure_daemon();
        }

        let result = self.serve(&upstream, &mut control, inner).await;
        self.transition(HostState::Closing);
        close(&upstream).await;
        result
    }

    async fn cleanup_cancelled(&self) {
        if !self.info.cleanup_on_cancel {
            debug!("transport closed during bring-up, leaving container");
            return;
        }
        let created = self.created.lock().take();
        if let Some(id) = created {
            info!(container = %id, "removing partially started container");
            if let Err(e) = self.runtime.remove(&id).await {
                warn!(container = %id, error = %e, "failed to remove container");
            }
        }
    }

    async fn bring_up(&self, upstream: &Mux, control: &MessageChannel) -> Result<Bootstrapped> {
        self.transition(HostState::ContainerStarting);
        progress(control, "runtime", "checking container runtime").await?;
        self.runtime
            .ping()
            .await
            .map_err(|e| Error::hop(HOP, e))?;

        progress(control, "source", "preparing workspace source").await?;
        let source_root =
            source::prepare(&self.info.source, &self.paths().content_dir(&self.info.id)).await?;
        let (spec, hooks) = self.resolve_container(source_root.as_deref())?;

        let (container_id, image) = self.start_container(control, source_root.as_deref(), &spec).await?;
        self.transition(HostState::ContainerReady);
        self.save_record(Some(ContainerDescriptor {
            id: container_id.clone(),
            image: image.clone(),
            state: ContainerState::Running,
            mounts: spec.mounts.clone(),
            env: spec.env.clone(),
            hooks: hooks.clone(),
            inactivity_timeout_secs: self.info.inactivity_timeout_secs,
        }))?;

        if let Some(binary) = &self.options.agent_binary {
            self.runtime
                .copy_into(&container_id, binary, &self.options.container_agent_path)
                .await?;
        }

        self.transition(HostState::BootstrappingAgent);
        progress(control, "agent", "starting container agent").await?;
        let mut inner_info = self.info.clone();
        let mut inner_spec = spec;
        inner_spec.build.image = Some(image.clone());
        let user = inner_spec.user.clone();
        inner_info.container = Some(inner_spec);
        inner_info.hooks = hooks;
        if self.host_daemon_enabled() {
            inner_info.inactivity_timeout_secs = None;
        }

        let command = vec![
            self.options.container_agent_path.clone(),
            "agent".to_string(),
            "container".to_string(),
            "setup".to_string(),
            "--workspace-info".to_string(),
            inner_info.to_arg()?,
        ];
        let (reader, writer, child) = self
            .launcher
            .launch(&container_id, user.as_deref(), &command)
            .await?
            .into_parts();
        let (mux, inner_control) = Mux::new(reader, writer, Role::Initiator);
        let mut inner_control = MessageChannel::new(inner_control);

        loop {
            tokio::select! {
                response = inner_control.recv::<AgentResponse>() => match response? {
                    Some(AgentResponse::Ready { warnings, .. }) => {
                        return Ok(Bootstrapped {
                            mux,
                            control: inner_control,
                            child,
                            container_id,
                            image,
                            warnings,
                        });
                    }
                    Some(AgentResponse::Error { message, code }) => {
                        return Err(Error::from_wire("container agent", code.as_deref(), message));
                    }
                    Some(update @ AgentResponse::Progress { .. }) => control.send(&update).await?,
                    Some(other) => debug!(response = ?other, "ignoring message during bootstrap"),
                    None => {
                        return Err(Error::bootstrap(
                            "container agent",
                            "exited before becoming ready",
                        ));
                    }
                },
                // hooks may need credentials before the agent is ready
                Some(channel) = mux.accept() => forward(upstream, channel, None),
            }
        }
    }

    /// Container spec and hooks from the payload, or from the source's
    /// devcontainer file. The source is mounted at the workspace folder.
    fn resolve_container(&self, source_root: Option<&Path>) -> Result<(ContainerSpec, Vec<HookSpec>)> {
        let (mut spec, hooks) = match (&self.info.container, &self.info.source, source_root) {
            (Some(spec), _, _) => (spec.clone(), self.info.hooks.clone()),
            (None, _, Some(root)) => {
                let relative = devcontainer::locate(root, self.info.devcontainer_path.as_deref())?
                    .ok_or_else(|| {
                        Error::config(format!("no devcontainer configuration in {}", root.display()))
                    })?;
                let config = devcontainer::load(root, &relative)?;
                (config.container, config.hooks)
            }
            (None, WorkspaceSource::Image { image }, None) => {
                let mut spec = ContainerSpec::default();
                spec.build.image = Some(image.clone());
                (spec, self.info.hooks.clone())
            }
            (None, _, None) => return Err(Error::config("workspace has no source to build from")),
        };

        let folder = spec
            .workspace_folder
            .clone()
            .unwrap_or_else(|| format!("/workspaces/{}", self.info.id));
        if let Some(root) = source_root {
            if !spec.mounts.iter().any(|m| m.target == folder) {
                spec.mounts.insert(
                    0,
                    MountSpec {
                        source: root.display().to_string(),
                        target: folder.clone(),
                        read_only: false,
                    },
                );
            }
        }
        spec.workspace_folder = Some(folder);
        Ok((spec, hooks))
    }

    /// Reuse the workspace container if there is one, else build and create
    /// it. Returns the container ID and image.
    async fn start_container(
        &self,
        control: &MessageChannel,
        source_root: Option<&Path>,
        spec: &ContainerSpec,
    ) -> Result<(String, String)> {
        if let Some(existing) = self.runtime.find(&self.info.id).await? {
            if existing.state != ContainerState::Running {
                progress(control, "container", "starting existing container").await?;
                self.runtime.start(&existing.id).await?;
            } else {
                debug!(container = %existing.id, "container already running");
            }
            return Ok((existing.id, existing.image));
        }

        progress(control, "build", "preparing image").await?;
        let image = self.builder.ensure_image(source_root, &spec.build).await?;
        if image.built {
            progress(control, "build", format!("built {}", image.reference)).await?;
        }

        progress(control, "container", "creating container").await?;
        let mut run = RunSpec::new(&self.info.id, &image.reference);
        run.mounts = spec.mounts.clone();
        run.env = spec.env.clone();
        let id = self.runtime.create(&run).await?;
        *self.created.lock() = Some(id.clone());
        self.runtime.start(&id).await?;
        info!(workspace = %self.info.id, container = %id, image = %image.reference, "container started");
        Ok((id, image.reference))
    }

    async fn serve(&self, upstream: &Mux, control: &mut MessageChannel, inner: Bootstrapped) -> Result<()> {
        let Bootstrapped {
            mux: inner_mux,
            control: mut inner_control,
            child,
            ..
        } = inner;
        let tracker = Arc::new(SessionTracker::new());
        let mut pending = VecDeque::new();
        let mut ticker = tokio::time::interval(DEFAULT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                channel = upstream.accept() => {
                    let Some(channel) = channel else {
                        debug!("upstream transport closed");
                        break Ok(());
                    };
                    let guard = (channel.kind() == channels::SSH).then(|| tracker.session());
                    if guard.is_some() {
                        self.mark_activity();
                    }
                    forward(&inner_mux, channel, guard);
                }
                channel = inner_mux.accept() => {
                    let Some(channel) = channel else {
                        warn!("container agent transport closed");
                        break Ok(());
                    };
                    forward(upstream, channel, None);
                }
                request = control.recv::<AgentRequest>() => match request {
                    Ok(Some(AgentRequest::Ping)) => {
                        control.send(&AgentResponse::Pong { version: PROTOCOL_VERSION }).await?;
                    }
                    Ok(Some(request)) => {
                        inner_control.send(&request).await?;
                        pending.push_back(request);
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                },
                response = inner_control.recv::<AgentResponse>() => match response {
                    Ok(Some(response)) => {
                        let answered = pending.pop_front();
                        control.send(&self.annotate(response, answered.as_ref())).await?;
                        if answered == Some(AgentRequest::Shutdown) {
                            info!("shutdown requested");
                            break Ok(());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                },
                _ = ticker.tick() => {
                    if tracker.active() > 0 {
                        self.mark_activity();
                    }
                }
            }
        };

        inner_mux.shutdown();
        reap(child, EXIT_GRACE).await;
        result
    }

    /// Add host-side details to a status reply.
    fn annotate(&self, response: AgentResponse, answered: Option<&AgentRequest>) -> AgentResponse {
        match (response, answered) {
            (AgentResponse::Ok { data }, Some(AgentRequest::Status)) => {
                let mut data = match data {
                    Some(serde_json::Value::Object(map)) => map,
                    _ => serde_json::Map::new(),
                };
                data.insert("workspace".into(), self.info.id.clone().into());
                data.insert("state".into(), format!("{:?}", self.state()).into());
                AgentResponse::Ok {
                    data: Some(data.into()),
                }
            }
            (response, _) => response,
        }
    }

    fn mark_activity(&self) {
        if let Err(e) = touch(&self.paths().activity_marker(&self.info.id)) {
            debug!(error = %e, "failed to touch activity marker");
        }
    }

    fn save_record(&self, container: Option<ContainerDescriptor>) -> Result<()> {
        let record = HostRecord {
            info: self.info.clone(),
            container,
        };
        crate::util::write_json(&self.paths().record(&self.info.id), &record)
    }

    /// Start the machine inactivity daemon unless one is running.
    fn ensure_daemon(&self) {
        let (Some(exe), Some(secs)) = (&self.options.daemon_exe, self.info.inactivity_timeout_secs)
        else {
            return;
        };
        let pidfile = Pidfile::new(self.paths().daemon_pidfile());
        if let Some(pid) = pidfile.running() {
            debug!(pid, "host daemon already running");
            return;
        }

        let args = vec![
            "agent".to_string(),
            "daemon".to_string(),
            "--timeout".to_string(),
            format!("{}s", secs),
            "--data-dir".to_string(),
            self.paths().data_dir().display().to_string(),
        ];
        match kled_agent::daemon::spawn_detached(exe, &args, &self.paths().daemon_log()) {
            Ok(pid) => info!(pid, timeout_secs = secs, "started host daemon"),
            Err(e) => warn!(error = %e, "failed to start host daemon"),
        }
    }

    // =========================================================================
    // One-shot operations
    // =========================================================================

    /// Build (or find cached) the workspace image without starting anything.
    pub async fn build(&self) -> Result<ImageRef> {
        let source_root =
            source::prepare(&self.info.source, &self.paths().content_dir(&self.info.id)).await?;
        let (spec, _) = self.resolve_container(source_root.as_deref())?;
        self.builder.ensure_image(source_root.as_deref(), &spec.build).await
    }

    /// Stop the workspace container. No-op if it is not running.
    pub async fn stop(&self) -> Result<()> {
        let Some(existing) = self.runtime.find(&self.info.id).await? else {
            debug!(workspace = %self.info.id, "no container to stop");
            return Ok(());
        };
        if existing.state == ContainerState::Running {
            self.runtime.stop(&existing.id).await?;
            info!(workspace = %self.info.id, container = %existing.id, "container stopped");
        }

        let path = self.paths().record(&self.info.id);
        if let Some(mut record) = crate::util::read_json::<HostRecord>(&path)? {
            if let Some(container) = record.container.as_mut() {
                container.state = ContainerState::Stopped;
            }
            crate::util::write_json(&path, &record)?;
        }
        Ok(())
    }

    /// Remove the workspace container and its host state.
    pub async fn delete(&self) -> Result<()> {
        if let Some(existing) = self.runtime.find(&self.info.id).await? {
            self.runtime.remove(&existing.id).await?;
            info!(workspace = %self.info.id, container = %existing.id, "container removed");
        }
        match std::fs::remove_dir_all(self.paths().workspace_dir(&self.info.id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Close `mux`, giving queued replies a bounded time to go out.
async fn close(mux: &Mux) {
    if tokio::time::timeout(EXIT_GRACE, mux.finish()).await.is_err() {
        debug!("transport did not flush in time");
    }
}

async fn progress(control: &MessageChannel, stage: &str, message: impl Into<String>) -> Result<()> {
    control
        .send(&AgentResponse::progress(stage, message))
        .await
        .map_err(Error::from)
}

/// Open the same kind of channel on `target` and relay `channel` to it.
fn forward(target: &Mux, channel: Channel, guard: Option<kled_agent::inactivity::SessionGuard>) {
    let target = target.clone();
    let kind = channel.kind().to_string();
    tokio::spawn(async move {
        let _guard = guard;
        match target.open(&kind).await {
            Ok(peer) => relay(channel, peer).await,
            Err(e) => {
                debug!(%kind, error = %e, "failed to open relay channel");
                channel.close().await;
            }
        }
    });
}
