//! kled container agent.
//!
//! Runs inside the workspace container, spawned by the host agent with its
//! stdin/stdout as the multiplexed transport. The agent:
//! - performs one-time setup (SSH server, platform access, credential helpers)
//! - runs the devcontainer lifecycle hooks
//! - reports `Ready` upstream and serves SSH sessions until the transport closes
//! - optionally starts the inactivity daemon
//!
//! Closing the transport cancels whatever is in flight.

pub mod credentials;
pub mod daemon;
pub mod error;
pub mod hooks;
pub mod inactivity;
pub mod paths;
pub mod platform;
pub mod process;
pub mod setup;
pub mod sshd;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use kled_protocol::{
    AgentResponse, ForwardingFeatures, MessageChannel, Mux, MuxError, Role, WorkspaceInfo,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use error::{Error, Result};

use credentials::CredentialForwarder;
use hooks::HookRunner;
use inactivity::{BusyMarker, SessionTracker};
use paths::AgentPaths;
use platform::PlatformLogin;
use setup::CredentialHelpers;
use sshd::SessionServer;

/// Version of this agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The container agent for one workspace.
pub struct ContainerAgent {
    info: WorkspaceInfo,
    paths: AgentPaths,
    exe: PathBuf,
    home: PathBuf,
}

impl ContainerAgent {
    pub fn new(info: WorkspaceInfo, paths: AgentPaths) -> Self {
        let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("kled"));
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        Self {
            info,
            paths,
            exe,
            home,
        }
    }

    /// Use `exe` as the kled binary for helpers and the daemon.
    pub fn with_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = exe.into();
        self
    }

    /// Use `home` as the container user's home directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    fn credentials_port(&self) -> u16 {
        self.info
            .credentials_port
            .unwrap_or(paths::DEFAULT_CREDENTIALS_PORT)
    }

    fn ssh_command(&self) -> Vec<String> {
        self.info.ssh_server_command.clone().unwrap_or_else(|| {
            vec![
                self.exe.display().to_string(),
                "helper".to_string(),
                "ssh-server".to_string(),
                "--stdio".to_string(),
            ]
        })
    }

    fn container_env(&self) -> BTreeMap<String, String> {
        let mut env = self
            .info
            .container
            .as_ref()
            .map(|c| c.env.clone())
            .unwrap_or_default();
        env.insert("KLED_WORKSPACE_ID".to_string(), self.info.id.clone());
        if self.info.features.any() {
            env.insert(
                paths::CREDENTIALS_PORT_ENV.to_string(),
                self.credentials_port().to_string(),
            );
        }
        env
    }

    fn workdir(&self) -> PathBuf {
        let requested = self.info.workdir.clone().or_else(|| {
            self.info
                .container
                .as_ref()
                .and_then(|c| c.workspace_folder.as_ref())
                .map(PathBuf::from)
        });
        sshd::resolve_workdir(requested.as_deref(), Some(self.home.clone()))
    }

    fn helpers(&self) -> CredentialHelpers {
        CredentialHelpers::new(
            self.paths.clone(),
            &self.exe,
            self.credentials_port(),
            &self.home,
        )
    }

    /// Set up the container over `reader`/`writer`, then serve sessions.
    ///
    /// Returns once the transport closes or upstream requests shutdown.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mux, control) = Mux::new(reader, writer, Role::Acceptor);
        let mut control = MessageChannel::new(control);
        let features = self.info.features;

        let outcome = tokio::select! {
            outcome = self.setup(&mut control) => outcome,
            _ = mux.closed() => Err(Error::Transport(MuxError::TransportClosed)),
        };
        let ready = match outcome {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "container setup failed");
                let _ = control
                    .send(&AgentResponse::error(e.code(), e.to_string()))
                    .await;
                finish(&mux).await;
                return Err(e);
            }
        };
        control.send(&ready).await?;

        let forwarder = Arc::new(CredentialForwarder::new(mux.clone(), features));
        let (stop_server, server_stopped) = oneshot::channel::<()>();
        let server = features.any().then(|| {
            let forwarder = forwarder.clone();
            let port = self.credentials_port();
            tokio::spawn(async move {
                let shutdown = async move {
                    let _ = server_stopped.await;
                };
                if let Err(e) = credentials::serve(forwarder, port, shutdown).await {
                    warn!(error = %e, "credentials server failed");
                }
            })
        });

        let sessions = SessionServer::new(
            self.ssh_command(),
            self.workdir(),
            self.info.session_mode,
            Arc::new(SessionTracker::new()),
        )
        .with_env(self.container_env())
        .with_shared_auth_sock(self.paths.data_dir().join("ssh-auth.sock"))
        .with_activity_marker(self.paths.activity_marker());

        let result = sessions.serve(&mux, &mut control).await;

        let _ = stop_server.send(());
        if let Some(server) = server {
            let _ = server.await;
        }
        self.helpers().uninstall(features);
        forwarder.clear_cache();
        finish(&mux).await;

        info!(workspace = %self.info.id, "container agent finished");
        result
    }

    async fn setup(&self, control: &mut MessageChannel) -> Result<AgentResponse> {
        self.paths.ensure()?;
        let first_start = setup::is_first_start(&self.paths);
        let mut warnings = Vec::new();

        control
            .send(&AgentResponse::progress("setup", "preparing container"))
            .await?;

        let ssh = self.ssh_command();
        if let Some(program) = ssh.first().map(PathBuf::from) {
            if program.is_absolute() && !program.exists() {
                return Err(Error::Setup(format!(
                    "ssh server command not found: {}",
                    program.display()
                )));
            }
        }

        if let Some(access) = &self.info.platform {
            control
                .send(&AgentResponse::progress("platform", "configuring platform access"))
                .await?;
            if let Err(e) = PlatformLogin::new(&self.exe).run(access).await {
                warnings.push(format!("platform access not configured: {}", e));
            }
        }

        if self.info.features.any() {
            warnings.extend(self.helpers().install(self.info.features)?);
        }

        let report = self.run_hooks(control, first_start).await?;
        warnings.extend(report.warnings);

        if first_start {
            setup::mark_setup_done(&self.paths)?;
        }

        if let Some(secs) = self.info.inactivity_timeout_secs {
            self.start_daemon(secs);
        }

        Ok(AgentResponse::Ready {
            container_id: container_hostname().unwrap_or_else(|| self.info.id.clone()),
            image: self
                .info
                .container
                .as_ref()
                .and_then(|c| c.build.image.clone())
                .unwrap_or_default(),
            warnings,
        })
    }

    async fn run_hooks(
        &self,
        control: &MessageChannel,
        first_start: bool,
    ) -> Result<hooks::HookReport> {
        let runner = HookRunner::new(Some(self.workdir()), self.container_env());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let run = async move {
            runner
                .run_all(&self.info.hooks, first_start, |hook| {
                    let _ = tx.send(AgentResponse::progress(
                        "hooks",
                        format!("running {} ({})", hook.name, hook.phase),
                    ));
                })
                .await
        };
        let forward = async {
            while let Some(progress) = rx.recv().await {
                let _ = control.send(&progress).await;
            }
        };

        let _busy = BusyMarker::create(self.paths.busy_marker());
        let (report, ()) = tokio::join!(run, forward);
        report
    }

    fn start_daemon(&self, timeout_secs: u64) {
        let pidfile = process::Pidfile::new(self.paths.daemon_pidfile());
        if let Some(pid) = pidfile.running() {
            debug!(pid, "inactivity daemon already running");
            return;
        }

        let args = vec![
            "agent".to_string(),
            "container".to_string(),
            "daemon".to_string(),
            "--timeout".to_string(),
            format!("{}s", timeout_secs),
        ];
        match daemon::spawn_detached(&self.exe, &args, &self.paths.daemon_log()) {
            Ok(pid) => info!(pid, timeout_secs, "started inactivity daemon"),
            Err(e) => warn!(error = %e, "failed to start inactivity daemon"),
        }
    }
}

/// Close the transport, letting queued replies go out first.
async fn finish(mux: &Mux) {
    if tokio::time::timeout(FLUSH_TIMEOUT, mux.finish()).await.is_err() {
        debug!("transport did not flush in time");
    }
}

fn container_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Serve the credentials API over a multiplexed transport until it closes.
///
/// This is the standalone `credentials-server` hop; the container agent
/// runs the same server in-process.
pub async fn run_credentials_server<R, W>(
    reader: R,
    writer: W,
    features: ForwardingFeatures,
    port: u16,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (mux, _control) = Mux::new(reader, writer, Role::Acceptor);
    let forwarder = Arc::new(CredentialForwarder::new(mux.clone(), features));
    let closed = mux.clone();
    credentials::serve(forwarder, port, async move { closed.closed().await }).await
}
