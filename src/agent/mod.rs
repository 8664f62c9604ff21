//! Host agent.
//!
//! Runs on the target machine as `kled agent workspace up`, spawned by the
//! client through the provider's "run agent" hop with its stdin/stdout as
//! the multiplexed transport. It brings the workspace container up, starts
//! the container agent inside it and relays everything between the two.

pub mod daemon;
mod host;
pub mod source;

pub use host::{
    AgentLauncher, HostAgent, HostOptions, HostRecord, HostState, RuntimeLauncher,
};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{Error, Result};

/// How long a hop process gets to exit after its transport closes.
pub const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Host agent state layout.
///
/// ```text
/// <data>/
///   daemon.pid, agent-daemon.log
///   builds/<fingerprint>.lock
///   workspaces/<id>/
///     workspace.json   host record
///     content/         git checkout
///     activity, busy   inactivity markers
/// ```
#[derive(Debug, Clone)]
pub struct HostPaths {
    data_dir: PathBuf,
}

impl HostPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    pub fn workspace_dir(&self, id: &str) -> PathBuf {
        self.workspaces_dir().join(id)
    }

    pub fn content_dir(&self, id: &str) -> PathBuf {
        self.workspace_dir(id).join("content")
    }

    pub fn record(&self, id: &str) -> PathBuf {
        self.workspace_dir(id).join("workspace.json")
    }

    pub fn activity_marker(&self, id: &str) -> PathBuf {
        self.workspace_dir(id).join("activity")
    }

    pub fn busy_marker(&self, id: &str) -> PathBuf {
        self.workspace_dir(id).join("busy")
    }

    pub fn build_locks(&self) -> PathBuf {
        self.data_dir.join("builds")
    }

    pub fn daemon_pidfile(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.data_dir.join("agent-daemon.log")
    }

    /// Every workspace record on the machine.
    pub fn records(&self) -> Result<Vec<HostRecord>> {
        let entries = match std::fs::read_dir(self.workspaces_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path().join("workspace.json");
            if let Some(record) = crate::util::read_json::<HostRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        Ok(records)
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One end of a stdio hop: the streams to the next process and, when we
/// spawned it, the process itself.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    /// Spawn `argv` with piped stdin/stdout. stderr is inherited so inner
    /// hop logs surface.
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::runtime("empty hop command"))?;
        debug!(?argv, "spawning hop");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::runtime(format!("failed to start {}: {}", program, e)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::runtime("hop process has no stdio"));
        };
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    pub fn into_parts(self) -> (BoxedReader, BoxedWriter, Option<Child>) {
        (self.reader, self.writer, self.child)
    }
}

/// Wait up to `grace` for `child` to exit, then kill it.
pub async fn reap(child: Option<Child>, grace: Duration) {
    let Some(mut child) = child else {
        return;
    };
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "hop process exited"),
        Ok(Err(e)) => debug!(error = %e, "failed to wait for hop process"),
        Err(_) => {
            debug!("hop process still running, killing");
            let _ = child.kill().await;
        }
    }
}
