//! Global kled configuration.
//!
//! Configuration lives in `config.toml` under the kled home directory
//! (`$KLED_HOME`, else `~/.kled`). `$KLED_CONFIG` points at a different
//! file. A missing file yields the defaults.

use crate::error::{Error, Result};
use kled_protocol::{PlatformAccess, SessionMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the kled home directory.
pub const HOME_ENV: &str = "KLED_HOME";

/// Environment variable overriding the config file path.
pub const CONFIG_ENV: &str = "KLED_CONFIG";

/// Directory name under the user's home.
const HOME_DIR_NAME: &str = ".kled";

/// Config file name under the kled home.
const CONFIG_FILE: &str = "config.toml";

/// Resolve the kled home directory.
pub fn kled_home() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(HOME_DIR_NAME)
}

/// Resolve the config file path.
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => kled_home().join(CONFIG_FILE),
    }
}

/// Global kled configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KledConfig {
    /// Configuration format version.
    pub version: u8,

    /// Provider used when a workspace does not name one.
    pub default_provider: String,

    /// Provider retry policy.
    pub retry: RetryConfig,

    /// Inactivity daemon settings.
    pub inactivity: InactivityConfig,

    /// Agent settings.
    pub agent: AgentConfig,

    /// Provider definitions by name.
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Managed-platform login passed to workspace containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformAccess>,
}

impl Default for KledConfig {
    fn default() -> Self {
        Self {
            version: 1,
            default_provider: "local".to_string(),
            retry: RetryConfig::default(),
            inactivity: InactivityConfig::default(),
            agent: AgentConfig::default(),
            providers: BTreeMap::new(),
            platform: None,
        }
    }
}

impl KledConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load configuration from `path`. Missing files yield the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Parse configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))?;
        crate::util::write_atomic(path, text.as_bytes())
    }

    /// Look up a provider definition.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Directory the host agent keeps its state in.
    pub fn agent_data_dir(&self) -> PathBuf {
        self.agent
            .data_dir
            .clone()
            .unwrap_or_else(|| kled_home().join("agent"))
    }
}

/// Provider retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "duration")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "duration")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Inactivity daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InactivityConfig {
    /// Timeout applied when `EXIT_AFTER_TIMEOUT` is set without a value.
    #[serde(with = "duration")]
    pub timeout: Duration,
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// How long a busy marker keeps a workspace active.
    #[serde(with = "duration")]
    pub busy_grace: Duration,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            poll_interval: kled_agent::inactivity::DEFAULT_POLL_INTERVAL,
            busy_grace: kled_agent::inactivity::DEFAULT_BUSY_GRACE,
        }
    }
}

/// Agent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Path of the kled binary on the target machine.
    pub path: String,
    /// Path of the kled binary inside workspace containers.
    pub container_path: String,
    /// Host agent state directory. Defaults to `<kled home>/agent`.
    pub data_dir: Option<PathBuf>,
    /// Machine-level command run when the inactivity timeout trips.
    pub shutdown_command: Vec<String>,
    /// Leave workspace containers, and so their machine, running on stop
    /// and on idle shutdown.
    pub keep_running: bool,
    /// Remove a partially started container when `up` is cancelled.
    pub cleanup_on_cancel: bool,
    pub session_mode: SessionMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            path: "kled".to_string(),
            container_path: "/usr/local/bin/kled".to_string(),
            data_dir: None,
            shutdown_command: Vec::new(),
            keep_running: false,
            cleanup_on_cancel: false,
            session_mode: SessionMode::Exclusive,
        }
    }
}

/// A provider definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// The local machine.
    Local,
    /// A pre-existing host reachable over SSH.
    Ssh {
        host: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        identity_file: Option<PathBuf>,
    },
    /// A provider driven by shell commands (cloud VMs, Kubernetes, kata).
    Command(CommandProviderConfig),
}

/// Commands of a command-driven provider.
///
/// Each command runs under `sh -c` with `MACHINE_ID`, `MACHINE_PROVIDER`
/// and the `env` table set. `status` prints one of `Running`, `Stopped`,
/// `Busy` or `NotFound`. `exec` runs `$KLED_COMMAND` on the machine with
/// stdio attached.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandProviderConfig {
    #[serde(default)]
    pub create: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub stop: Option<String>,
    #[serde(default)]
    pub delete: Option<String>,
    pub status: String,
    pub exec: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Serde adapter for human-readable durations (`"30s"`, `"10m"`).
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KledConfig::default();
        assert_eq!(config.default_provider, "local");
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.inactivity.poll_interval, Duration::from_secs(10));
        assert_eq!(config.inactivity.busy_grace, Duration::from_secs(1200));
        assert!(!config.agent.cleanup_on_cancel);
    }

    #[test]
    fn test_parse_human_durations_and_providers() {
        let config = KledConfig::parse(
            r#"
default_provider = "aws"

[retry]
initial_delay = "500ms"
max_attempts = 3

[inactivity]
timeout = "2h"

[providers.aws]
type = "command"
create = "aws-machine create"
status = "aws-machine status"
exec = "aws-machine ssh -- $KLED_COMMAND"

[providers.devbox]
type = "ssh"
host = "devbox.internal"
user = "dev"
"#,
        )
        .unwrap();

        assert_eq!(config.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.inactivity.timeout, Duration::from_secs(7200));
        assert!(matches!(
            config.provider("aws"),
            Some(ProviderConfig::Command(c)) if c.start.is_none()
        ));
        assert!(matches!(
            config.provider("devbox"),
            Some(ProviderConfig::Ssh { host, .. }) if host == "devbox.internal"
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = KledConfig::default();
        config.agent.keep_running = true;
        config.inactivity.timeout = Duration::from_secs(90);
        config.save_to(&path).unwrap();

        let loaded = KledConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = KledConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(loaded, KledConfig::default());
    }

    #[test]
    fn test_invalid_duration_is_config_error() {
        let err = KledConfig::parse("[retry]\ninitial_delay = \"soon\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
