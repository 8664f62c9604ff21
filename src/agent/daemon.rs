//! Machine-level inactivity daemon.
//!
//! Started detached by the host agent as `kled agent daemon` when the
//! machine has a shutdown command. Watches the markers of every workspace
//! on the machine; once all of them go stale it stops the workspace
//! containers and runs the shutdown command.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use kled_agent::inactivity::{
    touch, Activity, ActivitySource, CommandShutdown, InactivityMonitor, MarkerFiles,
    ShutdownAction, ShutdownChain, DEFAULT_BUSY_GRACE, DEFAULT_POLL_INTERVAL,
};
use kled_agent::process::Pidfile;

use super::HostPaths;
use crate::error::Result;
use crate::runtime::ContainerRuntime;

/// Host daemon settings.
#[derive(Debug, Clone)]
pub struct HostDaemonOptions {
    pub paths: HostPaths,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub busy_grace: Duration,
    /// Leave containers running on timeout.
    pub keep_running: bool,
    pub shutdown_command: Vec<String>,
}

impl HostDaemonOptions {
    pub fn new(paths: HostPaths, timeout: Duration) -> Self {
        Self {
            paths,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            busy_grace: DEFAULT_BUSY_GRACE,
            keep_running: false,
            shutdown_command: Vec::new(),
        }
    }
}

/// Markers of all workspaces on the machine, rescanned on every sample so
/// workspaces created after the daemon started are seen.
pub struct HostMarkers {
    paths: HostPaths,
    busy_grace: Duration,
    started: Instant,
}

impl HostMarkers {
    pub fn new(paths: HostPaths, busy_grace: Duration) -> Self {
        Self {
            paths,
            busy_grace,
            started: Instant::now(),
        }
    }

    /// Marker for the machine itself, touched when the daemon starts.
    fn machine_marker(&self) -> std::path::PathBuf {
        self.paths.data_dir().join("activity")
    }

    fn snapshot(&self) -> MarkerFiles {
        let mut activity = vec![self.machine_marker()];
        let mut busy = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.paths.workspaces_dir()) {
            for entry in entries.flatten() {
                let dir = entry.path();
                activity.push(dir.join("activity"));
                busy.push(dir.join("busy"));
            }
        }
        MarkerFiles::new(activity, busy, self.busy_grace).started_at(self.started)
    }
}

#[async_trait]
impl ActivitySource for HostMarkers {
    async fn sample(&self) -> Activity {
        self.snapshot().sample().await
    }
}

/// Stops every workspace container recorded on the machine.
pub struct StopWorkspaceContainers {
    paths: HostPaths,
    runtime: Arc<dyn ContainerRuntime>,
    keep_running: bool,
}

impl StopWorkspaceContainers {
    pub fn new(paths: HostPaths, runtime: Arc<dyn ContainerRuntime>, keep_running: bool) -> Self {
        Self {
            paths,
            runtime,
            keep_running,
        }
    }
}

#[async_trait]
impl ShutdownAction for StopWorkspaceContainers {
    async fn shutdown(&self) -> kled_agent::Result<()> {
        if self.keep_running {
            info!("keep_running set, leaving workspace containers up");
            return Ok(());
        }
        let records = self
            .paths
            .records()
            .map_err(|e| kled_agent::Error::Setup(e.to_string()))?;

        for record in records {
            if record.info.keep_running {
                continue;
            }
            let Some(container) = record.container else {
                continue;
            };
            info!(workspace = %record.info.id, container = %container.id, "stopping idle workspace");
            // one stuck container must not keep the machine up
            if let Err(e) = self.runtime.stop(&container.id).await {
                warn!(container = %container.id, error = %e, "failed to stop container");
            }
        }
        Ok(())
    }
}

/// Run the daemon until the machine has been idle for the timeout.
pub async fn run_host_daemon(
    options: HostDaemonOptions,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<()> {
    let paths = &options.paths;
    std::fs::create_dir_all(paths.data_dir())?;

    let pidfile = Pidfile::new(paths.daemon_pidfile());
    pidfile.acquire()?;

    let markers = HostMarkers::new(paths.clone(), options.busy_grace);
    touch(&markers.machine_marker())?;

    let mut chain: Vec<Box<dyn ShutdownAction>> = vec![Box::new(StopWorkspaceContainers::new(
        paths.clone(),
        runtime,
        options.keep_running,
    ))];
    if !options.shutdown_command.is_empty() {
        chain.push(Box::new(CommandShutdown::new(
            options.shutdown_command.clone(),
        )));
    }

    info!(
        timeout_secs = options.timeout.as_secs(),
        "host inactivity daemon started"
    );
    let monitor = InactivityMonitor::new(options.timeout, options.poll_interval);
    let result = monitor.run(&markers, &ShutdownChain(chain)).await;

    pidfile.release();
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::HostRecord;
    use crate::runtime::{BuildRequest, ContainerDescriptor, ContainerStatus, RunSpec};
    use kled_protocol::{WorkspaceInfo, WorkspaceSource};
    use parking_lot::Mutex;
    use std::path::Path;

    #[derive(Default)]
    struct StopRecorder(Mutex<Vec<String>>);

    #[async_trait]
    impl ContainerRuntime for StopRecorder {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn image_exists(&self, _image: &str) -> Result<bool> {
            Ok(true)
        }
        async fn pull(&self, _image: &str) -> Result<()> {
            Ok(())
        }
        async fn build(&self, _request: &BuildRequest) -> Result<String> {
            Ok(String::new())
        }
        async fn find(&self, _workspace_id: &str) -> Result<Option<ContainerStatus>> {
            Ok(None)
        }
        async fn create(&self, _spec: &RunSpec) -> Result<String> {
            Ok("c".into())
        }
        async fn start(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, id: &str) -> Result<()> {
            self.0.lock().push(id.to_string());
            Ok(())
        }
        async fn remove(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn copy_into(&self, _id: &str, _src: &Path, _dest: &str) -> Result<()> {
            Ok(())
        }
        fn exec_command(&self, id: &str, _user: Option<&str>, command: &[String]) -> Vec<String> {
            let mut argv = vec!["exec".to_string(), id.to_string()];
            argv.extend(command.iter().cloned());
            argv
        }
    }

    fn write_record(paths: &HostPaths, id: &str, container: &str, keep_running: bool) {
        let mut info = WorkspaceInfo::new(
            id,
            WorkspaceSource::Image {
                image: "ubuntu".into(),
            },
        );
        info.keep_running = keep_running;
        let record = HostRecord {
            info,
            container: Some(ContainerDescriptor {
                id: container.into(),
                ..Default::default()
            }),
        };
        crate::util::write_json(&paths.record(id), &record).unwrap();
    }

    #[tokio::test]
    async fn test_stops_containers_except_keep_running() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(dir.path());
        write_record(&paths, "alpha", "c-alpha", false);
        write_record(&paths, "beta", "c-beta", true);

        let runtime = Arc::new(StopRecorder::default());
        let action = StopWorkspaceContainers::new(paths.clone(), runtime.clone(), false);
        action.shutdown().await.unwrap();
        assert_eq!(*runtime.0.lock(), vec!["c-alpha".to_string()]);

        let runtime = Arc::new(StopRecorder::default());
        let action = StopWorkspaceContainers::new(paths, runtime.clone(), true);
        action.shutdown().await.unwrap();
        assert!(runtime.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_busy_workspace_keeps_machine_active() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(dir.path());
        let markers = HostMarkers::new(paths.clone(), DEFAULT_BUSY_GRACE);
        assert!(matches!(markers.sample().await, Activity::IdleSince(_)));

        // workspace created after the daemon started
        touch(&paths.busy_marker("late")).unwrap();
        assert_eq!(markers.sample().await, Activity::Active);
    }

    #[tokio::test]
    async fn test_daemon_stops_and_runs_shutdown_command() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(dir.path().join("data"));
        write_record(&paths, "alpha", "c-alpha", false);
        let flag = dir.path().join("powered-off");

        let mut options = HostDaemonOptions::new(paths.clone(), Duration::from_millis(200));
        options.poll_interval = Duration::from_millis(20);
        options.shutdown_command = vec![
            "/bin/sh".into(),
            "-c".into(),
            format!("touch {}", flag.display()),
        ];

        let runtime = Arc::new(StopRecorder::default());
        run_host_daemon(options, runtime.clone()).await.unwrap();

        assert_eq!(*runtime.0.lock(), vec!["c-alpha".to_string()]);
        assert!(flag.exists());
        assert!(!paths.daemon_pidfile().exists());
    }
}
