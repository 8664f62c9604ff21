//! The pidfile that keeps a daemon to one instance per container.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Check if a process is alive.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid, 0) == 0 }
}

/// A pidfile recording the running instance of a daemon.
#[derive(Debug, Clone)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the file, if any.
    pub fn read(&self) -> Option<libc::pid_t> {
        std::fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// PID of a live instance other than this process.
    pub fn running(&self) -> Option<libc::pid_t> {
        self.read()
            .filter(|pid| *pid != std::process::id() as libc::pid_t && is_alive(*pid))
    }

    /// Record this process. Fails if another live instance is recorded.
    pub fn acquire(&self) -> Result<()> {
        if let Some(pid) = self.running() {
            return Err(Error::Setup(format!("already running as pid {}", pid)));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", std::process::id()))?;
        Ok(())
    }

    /// Remove the file if it still names this process.
    pub fn release(&self) {
        if self.read() == Some(std::process::id() as libc::pid_t) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_current_process() {
        let pid = std::process::id() as libc::pid_t;
        assert!(is_alive(pid));
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
    }

    #[test]
    fn test_pidfile_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = Pidfile::new(dir.path().join("daemon.pid"));

        assert_eq!(pidfile.read(), None);
        pidfile.acquire().unwrap();
        assert_eq!(pidfile.read(), Some(std::process::id() as libc::pid_t));
        // our own pid does not count as another instance
        assert_eq!(pidfile.running(), None);

        pidfile.release();
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn test_pidfile_refuses_live_instance() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = Pidfile::new(dir.path().join("daemon.pid"));

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(pidfile.path(), child.id().to_string()).unwrap();

        assert_eq!(pidfile.running(), Some(child.id() as libc::pid_t));
        assert!(pidfile.acquire().is_err());

        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(pidfile.running(), None);
        pidfile.acquire().unwrap();
    }

    #[test]
    fn test_stale_pidfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = Pidfile::new(dir.path().join("daemon.pid"));
        std::fs::write(pidfile.path(), "999999999\n").unwrap();

        pidfile.acquire().unwrap();
        assert_eq!(pidfile.read(), Some(std::process::id() as libc::pid_t));
    }
}
