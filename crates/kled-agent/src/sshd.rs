//! SSH session serving.
//!
//! Every `ssh` channel the upstream opens becomes one SSH server process
//! speaking on its stdio, bridged to the channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use kled_protocol::{
    bridge, channels, AgentRequest, AgentResponse, Channel, MessageChannel, Mux, SessionMode,
    PROTOCOL_VERSION,
};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inactivity::{touch, SessionTracker, DEFAULT_POLL_INTERVAL};

/// How long a session process may linger after its channel closed.
const SESSION_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Environment variable pointing SSH clients at the agent socket.
const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// Start directory for sessions: the requested folder if it exists, else home.
pub fn resolve_workdir(requested: Option<&Path>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = requested {
        if dir.is_dir() {
            return dir.to_path_buf();
        }
        debug!(workdir = %dir.display(), "workdir missing, falling back to home");
    }
    home.filter(|h| h.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Accepts SSH sessions over a multiplexed transport.
pub struct SessionServer {
    command: Vec<String>,
    workdir: PathBuf,
    mode: SessionMode,
    env: BTreeMap<String, String>,
    tracker: Arc<SessionTracker>,
    activity_marker: Option<PathBuf>,
    exclusive: Arc<Semaphore>,
}

impl SessionServer {
    pub fn new(
        command: Vec<String>,
        workdir: PathBuf,
        mode: SessionMode,
        tracker: Arc<SessionTracker>,
    ) -> Self {
        Self {
            command,
            workdir,
            mode,
            env: BTreeMap::new(),
            tracker,
            activity_marker: None,
            exclusive: Arc::new(Semaphore::new(1)),
        }
    }

    /// Extra environment for session processes.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// In shared mode, every session uses this agent socket.
    pub fn with_shared_auth_sock(mut self, sock: impl Into<PathBuf>) -> Self {
        if self.mode == SessionMode::Shared {
            self.env
                .insert(SSH_AUTH_SOCK.to_string(), sock.into().display().to_string());
        }
        self
    }

    /// File touched while sessions are active, read by the inactivity daemon.
    pub fn with_activity_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.activity_marker = Some(path.into());
        self
    }

    /// Serve until the transport closes or upstream asks to shut down.
    pub async fn serve(&self, mux: &Mux, control: &mut MessageChannel) -> Result<()> {
        let mut sessions = JoinSet::new();
        let mut ticker = tokio::time::interval(DEFAULT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(mode = ?self.mode, workdir = %self.workdir.display(), "serving ssh sessions");

        loop {
            tokio::select! {
                channel = mux.accept() => {
                    let Some(channel) = channel else {
                        debug!("transport closed");
                        break;
                    };
                    self.dispatch(channel, &mut sessions);
                }
                request = control.recv::<AgentRequest>() => {
                    match request? {
                        Some(AgentRequest::Ping) => {
                            control.send(&AgentResponse::Pong { version: PROTOCOL_VERSION }).await?;
                        }
                        Some(AgentRequest::Status) => {
                            let data = serde_json::json!({ "sessions": self.tracker.active() });
                            control.send(&AgentResponse::Ok { data: Some(data) }).await?;
                        }
                        Some(AgentRequest::Shutdown) => {
                            info!("shutdown requested");
                            control.send(&AgentResponse::Ok { data: None }).await?;
                            break;
                        }
                        None => {
                            debug!("control channel closed");
                            break;
                        }
                    }
                }
                Some(finished) = sessions.join_next() => {
                    match finished {
                        Ok(Ok(())) => debug!("session finished"),
                        Ok(Err(e)) => warn!(error = %e, "session failed"),
                        Err(e) => warn!(error = %e, "session task panicked"),
                    }
                }
                _ = ticker.tick() => {
                    if self.tracker.active() > 0 {
                        self.touch_activity();
                    }
                }
            }
        }

        // dropping the tasks kills their session processes
        sessions.abort_all();
        Ok(())
    }

    fn dispatch(&self, channel: Channel, sessions: &mut JoinSet<Result<()>>) {
        if channel.kind() != channels::SSH {
            debug!(kind = channel.kind(), "ignoring unexpected channel");
            return;
        }

        let permit = match self.mode {
            SessionMode::Shared => None,
            SessionMode::Exclusive => match self.exclusive.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(channel = channel.id(), "session already active, rejecting");
                    return;
                }
            },
        };

        let guard = self.tracker.session();
        self.touch_activity();

        let command = self.command.clone();
        let workdir = self.workdir.clone();
        let env = self.env.clone();
        sessions.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            run_session(channel, &command, &workdir, &env).await
        });
    }

    fn touch_activity(&self) {
        if let Some(marker) = &self.activity_marker {
            if let Err(e) = touch(marker) {
                debug!(error = %e, "failed to touch activity marker");
            }
        }
    }
}

async fn run_session(
    channel: Channel,
    command: &[String],
    workdir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(Error::Setup("empty ssh server command".into()));
    };

    let mut child = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(Error::Setup("session process has no stdio".into()));
    };

    debug!(channel = channel.id(), "session started");
    bridge(channel, stdout, stdin).await?;

    match tokio::time::timeout(SESSION_EXIT_GRACE, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!(?status, "session process exited");
        }
        Err(_) => {
            debug!("session process still running, killing");
            child.kill().await?;
        }
    }
    Ok(())
}
