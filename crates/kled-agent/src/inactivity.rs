//! Inactivity daemon.
//!
//! [`InactivityMonitor`] samples an [`ActivitySource`] every poll interval
//! and returns once nothing has been active for the configured timeout.
//! The caller then runs its [`ShutdownAction`].
//!
//! Timing uses `tokio::time`, so the loop can be driven with paused time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default interval between activity samples.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Extra time a busy marker keeps the workspace alive.
pub const DEFAULT_BUSY_GRACE: Duration = Duration::from_secs(20 * 60);

/// One activity sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Something is active right now.
    Active,
    /// Idle since the given instant.
    IdleSince(Instant),
}

/// Where activity is read from.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn sample(&self) -> Activity;
}

/// What happens once the timeout elapses.
#[async_trait]
pub trait ShutdownAction: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// Idle-timeout loop.
#[derive(Debug, Clone, Copy)]
pub struct InactivityMonitor {
    timeout: Duration,
    poll_interval: Duration,
}

impl InactivityMonitor {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until `source` has been idle for the timeout.
    ///
    /// Returns the idle duration observed when the timeout tripped. Never
    /// returns before the timeout has fully elapsed since the last activity.
    pub async fn wait_idle(&self, source: &dyn ActivitySource) -> Duration {
        loop {
            let remaining = match source.sample().await {
                Activity::Active => self.timeout,
                Activity::IdleSince(since) => {
                    let idle = Instant::now().saturating_duration_since(since);
                    if idle >= self.timeout {
                        return idle;
                    }
                    self.timeout - idle
                }
            };
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    /// Wait for the timeout, then run `action`.
    pub async fn run(&self, source: &dyn ActivitySource, action: &dyn ShutdownAction) -> Result<()> {
        let idle = self.wait_idle(source).await;
        info!(
            idle_secs = idle.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "inactivity timeout reached, shutting down"
        );
        action.shutdown().await
    }
}

// =============================================================================
// Session tracking
// =============================================================================

#[derive(Debug)]
struct SessionState {
    active: usize,
    last_change: Instant,
}

/// Counts attached SSH sessions. Active while at least one is attached.
#[derive(Debug)]
pub struct SessionTracker {
    state: Mutex<SessionState>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState {
                active: 0,
                last_change: Instant::now(),
            }),
        }
    }

    /// Record an attach. Resets the idle clock.
    pub fn attach(&self) {
        let mut state = self.state.lock();
        state.active += 1;
        state.last_change = Instant::now();
    }

    /// Record a detach. The idle clock starts from now.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.last_change = Instant::now();
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Attach and return a guard that detaches on drop.
    pub fn session(self: &Arc<Self>) -> SessionGuard {
        self.attach();
        SessionGuard {
            tracker: self.clone(),
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActivitySource for SessionTracker {
    async fn sample(&self) -> Activity {
        let state = self.state.lock();
        if state.active > 0 {
            Activity::Active
        } else {
            Activity::IdleSince(state.last_change)
        }
    }
}

/// Detaches its session when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.detach();
    }
}

// =============================================================================
// Marker files
// =============================================================================

/// Activity derived from marker file modification times.
///
/// The most recent mtime among the activity markers counts as the last
/// activity. A busy marker younger than the busy grace period counts as
/// active.
#[derive(Debug, Clone)]
pub struct MarkerFiles {
    activity: Vec<PathBuf>,
    busy: Vec<PathBuf>,
    busy_grace: Duration,
    started: Instant,
}

impl MarkerFiles {
    pub fn new(activity: Vec<PathBuf>, busy: Vec<PathBuf>, busy_grace: Duration) -> Self {
        Self {
            activity,
            busy,
            busy_grace,
            started: Instant::now(),
        }
    }

    /// Count idle time from `started` when no marker exists yet.
    pub fn started_at(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    /// Touch the first activity marker, creating it if needed.
    pub fn touch(&self) -> std::io::Result<()> {
        match self.activity.first() {
            Some(path) => touch(path),
            None => Ok(()),
        }
    }
}

/// Set a file's mtime to now, creating it and its parent if needed.
pub fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.set_modified(SystemTime::now())
}

/// Present while a long-running operation is in flight; [`MarkerFiles`]
/// counts it as activity. Removed on drop.
#[derive(Debug)]
pub struct BusyMarker(PathBuf);

impl BusyMarker {
    /// Write the marker. Failure only loses the protection, so it is logged.
    pub fn create(path: PathBuf) -> Self {
        if let Err(e) = touch(&path) {
            debug!(error = %e, path = %path.display(), "failed to write busy marker");
        }
        Self(path)
    }
}

impl Drop for BusyMarker {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

#[async_trait]
impl ActivitySource for MarkerFiles {
    async fn sample(&self) -> Activity {
        if self
            .busy
            .iter()
            .filter_map(|p| age(p))
            .any(|a| a < self.busy_grace)
        {
            return Activity::Active;
        }

        let now = Instant::now();
        let youngest = self.activity.iter().filter_map(|p| age(p)).min();
        match youngest {
            Some(age) => Activity::IdleSince(now.checked_sub(age).unwrap_or(self.started)),
            // nothing touched yet: idle since the daemon started
            None => Activity::IdleSince(self.started),
        }
    }
}

// =============================================================================
// Shutdown actions
// =============================================================================

/// Run a command on timeout.
#[derive(Debug, Clone)]
pub struct CommandShutdown {
    argv: Vec<String>,
}

impl CommandShutdown {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl ShutdownAction for CommandShutdown {
    async fn shutdown(&self) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(Error::Setup("empty shutdown command".into()));
        };
        debug!(command = ?self.argv, "running shutdown command");
        let status = Command::new(program).args(args).status().await?;
        if !status.success() {
            return Err(Error::Setup(format!(
                "shutdown command exited with {}",
                status
            )));
        }
        Ok(())
    }
}

/// Stop the container by terminating its init process.
#[derive(Debug, Clone, Copy)]
pub struct StopContainer;

#[async_trait]
impl ShutdownAction for StopContainer {
    async fn shutdown(&self) -> Result<()> {
        // SAFETY: kill has no memory safety requirements
        let rc = unsafe { libc::kill(1, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            warn!(error = %err, "failed to signal container init");
            return Err(err.into());
        }
        Ok(())
    }
}

/// Run several actions in order, stopping at the first failure.
pub struct ShutdownChain(pub Vec<Box<dyn ShutdownAction>>);

#[async_trait]
impl ShutdownAction for ShutdownChain {
    async fn shutdown(&self) -> Result<()> {
        for action in &self.0 {
            action.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    #[derive(Default)]
    struct CountingAction(AtomicUsize);

    #[async_trait]
    impl ShutdownAction for CountingAction {
        async fn shutdown(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_timeout_not_before() {
        let start = Instant::now();
        let tracker = Arc::new(SessionTracker::new());
        let monitor = InactivityMonitor::new(TEN_MINUTES, DEFAULT_POLL_INTERVAL);

        let source = tracker.clone();
        let fired = tokio::spawn(async move {
            monitor.wait_idle(source.as_ref()).await;
            Instant::now()
        });

        let fired_at = fired.await.unwrap();
        assert!(fired_at - start >= TEN_MINUTES);
        assert!(fired_at - start < TEN_MINUTES + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_resets_timer() {
        let start = Instant::now();
        let tracker = Arc::new(SessionTracker::new());
        let monitor = InactivityMonitor::new(TEN_MINUTES, DEFAULT_POLL_INTERVAL);

        let source = tracker.clone();
        let fired = tokio::spawn(async move {
            monitor.wait_idle(source.as_ref()).await;
            Instant::now()
        });

        tokio::time::sleep(Duration::from_secs(9 * 60)).await;
        drop(tracker.session());

        let fired_at = fired.await.unwrap();
        assert!(fired_at - start >= Duration::from_secs(19 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_session_blocks_shutdown() {
        let tracker = Arc::new(SessionTracker::new());
        let monitor = InactivityMonitor::new(TEN_MINUTES, DEFAULT_POLL_INTERVAL);
        let action = Arc::new(CountingAction::default());

        let guard = tracker.session();
        let (source, act) = (tracker.clone(), action.clone());
        let task = tokio::spawn(async move { monitor.run(source.as_ref(), act.as_ref()).await });

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(action.0.load(Ordering::SeqCst), 0);

        drop(guard);
        task.await.unwrap().unwrap();
        assert_eq!(action.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_marker_guard_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent").join("busy");
        let markers = MarkerFiles::new(
            vec![dir.path().join("activity")],
            vec![path.clone()],
            DEFAULT_BUSY_GRACE,
        );

        let busy = BusyMarker::create(path.clone());
        assert!(path.exists());
        assert_eq!(markers.sample().await, Activity::Active);

        drop(busy);
        assert!(!path.exists());
        assert!(matches!(markers.sample().await, Activity::IdleSince(_)));
    }

    #[tokio::test]
    async fn test_busy_marker_counts_as_active() {
        let dir = tempfile::tempdir().unwrap();
        let busy = dir.path().join("busy");
        let markers = MarkerFiles::new(
            vec![dir.path().join("activity")],
            vec![busy.clone()],
            DEFAULT_BUSY_GRACE,
        );

        assert!(matches!(markers.sample().await, Activity::IdleSince(_)));
        touch(&busy).unwrap();
        assert_eq!(markers.sample().await, Activity::Active);
    }

    #[tokio::test]
    async fn test_touch_creates_activity_marker() {
        let dir = tempfile::tempdir().unwrap();
        let activity = dir.path().join("nested").join("activity");
        let markers = MarkerFiles::new(vec![activity.clone()], vec![], DEFAULT_BUSY_GRACE);

        markers.touch().unwrap();
        assert!(activity.exists());
        let Activity::IdleSince(since) = markers.sample().await else {
            panic!("expected idle sample");
        };
        assert!(since.elapsed() < Duration::from_secs(5));
    }
}
