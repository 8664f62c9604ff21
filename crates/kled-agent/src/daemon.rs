//! In-container inactivity daemon.
//!
//! Started detached by the container agent when an inactivity timeout is
//! configured. Reads the activity and busy markers the serve loop and hook
//! runs maintain, and stops the container once they go stale.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::inactivity::{
    CommandShutdown, InactivityMonitor, MarkerFiles, ShutdownAction, StopContainer,
    DEFAULT_BUSY_GRACE, DEFAULT_POLL_INTERVAL,
};
use crate::paths::AgentPaths;
use crate::process::Pidfile;

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub paths: AgentPaths,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub busy_grace: Duration,
    /// Command run on timeout instead of stopping the container.
    pub shutdown_command: Option<Vec<String>>,
}

impl DaemonOptions {
    pub fn new(paths: AgentPaths, timeout: Duration) -> Self {
        Self {
            paths,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            busy_grace: DEFAULT_BUSY_GRACE,
            shutdown_command: None,
        }
    }
}

/// Run the daemon until the timeout triggers a shutdown.
pub async fn run_daemon(options: DaemonOptions) -> Result<()> {
    let paths = &options.paths;
    paths.ensure()?;

    let pidfile = Pidfile::new(paths.daemon_pidfile());
    pidfile.acquire()?;

    let markers = MarkerFiles::new(
        vec![paths.activity_marker()],
        vec![paths.busy_marker()],
        options.busy_grace,
    );
    // a fresh start counts as activity
    markers.touch()?;

    let action: Box<dyn ShutdownAction> = match &options.shutdown_command {
        Some(argv) => Box::new(CommandShutdown::new(argv.clone())),
        None => Box::new(StopContainer),
    };

    info!(
        timeout_secs = options.timeout.as_secs(),
        "inactivity daemon started"
    );
    let monitor = InactivityMonitor::new(options.timeout, options.poll_interval);
    let result = monitor.run(&markers, action.as_ref()).await;

    pidfile.release();
    result
}

/// Start `exe args...` in its own session, logging to `log`.
///
/// Returns the child PID. The child outlives the caller.
pub fn spawn_detached(exe: &Path, args: &[String], log: &Path) -> Result<u32> {
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)?;

    let mut cmd = std::process::Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file);
    // SAFETY: setsid is async-signal-safe
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    Ok(child.id())
}
