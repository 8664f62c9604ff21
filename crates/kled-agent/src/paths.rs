//! Path constants and helpers for the container agent.
//!
//! Everything the agent writes inside the container lives under one data
//! directory so a container restart keeps it and a rebuild discards it.

use std::path::{Path, PathBuf};

// =============================================================================
// Data Directory
// =============================================================================

/// Default agent data directory inside the container.
pub const AGENT_DATA_DIR: &str = "/var/lib/kled-agent";

/// Environment variable overriding [`AGENT_DATA_DIR`].
pub const AGENT_DATA_DIR_ENV: &str = "KLED_AGENT_DATA";

/// Directory helper shims are installed into.
pub const HELPER_BIN_DIR: &str = "/usr/local/bin";

// =============================================================================
// File Names
// =============================================================================

/// Marker written once setup (and the once-per-container hooks) finished.
const SETUP_MARKER: &str = "setup.done";

/// Touched whenever a session attaches or is active.
const ACTIVITY_MARKER: &str = "activity";

/// Present while an up is in progress.
const BUSY_MARKER: &str = "busy";

/// Pidfile of the inactivity daemon.
const DAEMON_PIDFILE: &str = "daemon.pid";

/// Log file of the inactivity daemon.
const DAEMON_LOG: &str = "agent-daemon.log";

/// Docker credential helper shim (docker resolves `credsStore: kled` to it).
pub const DOCKER_HELPER_NAME: &str = "docker-credential-kled";

/// Program git calls for SSH commit signing.
pub const SSH_SIGNATURE_HELPER_NAME: &str = "kled-ssh-signature";

// =============================================================================
// Ports
// =============================================================================

/// Default port of the in-container credentials server.
pub const DEFAULT_CREDENTIALS_PORT: u16 = 12049;

/// Environment variable the helpers read the credentials port from.
pub const CREDENTIALS_PORT_ENV: &str = "KLED_CREDENTIALS_PORT";

// =============================================================================
// Path Helper Functions
// =============================================================================

/// Resolved agent locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    data_dir: PathBuf,
    bin_dir: PathBuf,
}

impl AgentPaths {
    /// Paths rooted at `data_dir`, with helpers in `bin_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bin_dir: bin_dir.into(),
        }
    }

    /// Paths from the environment, falling back to the defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os(AGENT_DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(AGENT_DATA_DIR));
        Self::new(data_dir, HELPER_BIN_DIR)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn setup_marker(&self) -> PathBuf {
        self.data_dir.join(SETUP_MARKER)
    }

    pub fn activity_marker(&self) -> PathBuf {
        self.data_dir.join(ACTIVITY_MARKER)
    }

    pub fn busy_marker(&self) -> PathBuf {
        self.data_dir.join(BUSY_MARKER)
    }

    pub fn daemon_pidfile(&self) -> PathBuf {
        self.data_dir.join(DAEMON_PIDFILE)
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.data_dir.join(DAEMON_LOG)
    }

    pub fn docker_helper(&self) -> PathBuf {
        self.bin_dir.join(DOCKER_HELPER_NAME)
    }

    pub fn ssh_signature_helper(&self) -> PathBuf {
        self.bin_dir.join(SSH_SIGNATURE_HELPER_NAME)
    }

    /// Create the data directory.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

impl Default for AgentPaths {
    fn default() -> Self {
        Self::new(AGENT_DATA_DIR, HELPER_BIN_DIR)
    }
}

/// Credentials port from the environment, or the default.
pub fn credentials_port_from_env() -> u16 {
    std::env::var(CREDENTIALS_PORT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CREDENTIALS_PORT)
}
