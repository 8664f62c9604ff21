//! One-time container setup: setup marker and credential helper wiring.

use std::path::{Path, PathBuf};

use kled_protocol::ForwardingFeatures;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::paths::AgentPaths;

/// Docker `credsStore` value resolving to [`crate::paths::DOCKER_HELPER_NAME`].
const DOCKER_CREDS_STORE: &str = "kled";

/// Whether setup has not yet completed in this container instance.
pub fn is_first_start(paths: &AgentPaths) -> bool {
    !paths.setup_marker().exists()
}

/// Record that setup completed in this container instance.
pub fn mark_setup_done(paths: &AgentPaths) -> Result<()> {
    paths.ensure()?;
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    std::fs::write(paths.setup_marker(), format!("{}\n", stamp))?;
    Ok(())
}

/// Points git and docker at the kled helper commands.
///
/// Everything installed here is removed again by [`uninstall`] when the
/// session ends.
///
/// [`uninstall`]: CredentialHelpers::uninstall
#[derive(Debug, Clone)]
pub struct CredentialHelpers {
    paths: AgentPaths,
    exe: PathBuf,
    port: u16,
    home: PathBuf,
}

impl CredentialHelpers {
    pub fn new(paths: AgentPaths, exe: impl Into<PathBuf>, port: u16, home: impl Into<PathBuf>) -> Self {
        Self {
            paths,
            exe: exe.into(),
            port,
            home: home.into(),
        }
    }

    /// Install the helpers for the enabled features. Returns warnings.
    pub fn install(&self, features: ForwardingFeatures) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if features.docker_credentials {
            self.write_shim(&self.paths.docker_helper(), "docker-credentials")?;
            self.set_docker_creds_store(true)?;
        }

        if features.git_credentials {
            let helper = format!(
                "!{} agent git-credentials --port {}",
                sh_quote(&self.exe.display().to_string()),
                self.port
            );
            if let Err(e) = self.git_config(&["credential.helper", &helper]) {
                warnings.push(format!("git credential helper not configured: {}", e));
            }
        }

        if features.git_ssh_signature {
            let shim = self.paths.ssh_signature_helper();
            self.write_shim(&shim, "git-ssh-signature")?;
            let program = shim.display().to_string();
            let result = self
                .git_config(&["gpg.format", "ssh"])
                .and_then(|_| self.git_config(&["gpg.ssh.program", &program]));
            if let Err(e) = result {
                warnings.push(format!("git ssh signing not configured: {}", e));
            }
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        Ok(warnings)
    }

    /// Undo [`install`](Self::install). Best effort.
    pub fn uninstall(&self, features: ForwardingFeatures) {
        if features.docker_credentials {
            if let Err(e) = self.set_docker_creds_store(false) {
                debug!(error = %e, "failed to reset docker credsStore");
            }
            let _ = std::fs::remove_file(self.paths.docker_helper());
        }
        if features.git_credentials {
            let _ = self.git_config(&["--unset", "credential.helper"]);
        }
        if features.git_ssh_signature {
            let _ = self.git_config(&["--unset", "gpg.ssh.program"]);
            let _ = std::fs::remove_file(self.paths.ssh_signature_helper());
        }
    }

    fn docker_config_path(&self) -> PathBuf {
        self.home.join(".docker").join("config.json")
    }

    fn set_docker_creds_store(&self, enable: bool) -> Result<()> {
        let path = self.docker_config_path();
        let mut config: Value = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|_| Value::Object(Default::default())),
            Err(_) if !enable => return Ok(()),
            Err(_) => Value::Object(Default::default()),
        };
        let Some(object) = config.as_object_mut() else {
            return Ok(());
        };

        if enable {
            object.insert("credsStore".into(), Value::String(DOCKER_CREDS_STORE.into()));
        } else if object.get("credsStore").and_then(Value::as_str) == Some(DOCKER_CREDS_STORE) {
            object.remove("credsStore");
        } else {
            return Ok(());
        }

        write_atomic(&path, &serde_json::to_vec_pretty(&config)?)
    }

    fn write_shim(&self, path: &Path, subcommand: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let script = format!(
            "#!/bin/sh\nexec {} agent {} --port {} \"$@\"\n",
            sh_quote(&self.exe.display().to_string()),
            subcommand,
            self.port
        );
        std::fs::write(path, script)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn git_config(&self, args: &[&str]) -> std::io::Result<()> {
        let status = std::process::Command::new("git")
            .arg("config")
            .arg("--global")
            .args(args)
            .env("HOME", &self.home)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("git config exited with {}", status)))
        }
    }
}

/// Replace `path` through a temp file in the same directory, so a crash
/// never leaves it half written.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Quote a string for `/bin/sh`.
pub fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helpers(root: &Path) -> CredentialHelpers {
        let paths = AgentPaths::new(root.join("data"), root.join("bin"));
        CredentialHelpers::new(paths, "/opt/kled/kled", 12049, root.join("home"))
    }

    #[test]
    fn test_setup_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::new(dir.path().join("data"), dir.path().join("bin"));
        assert!(is_first_start(&paths));
        mark_setup_done(&paths).unwrap();
        assert!(!is_first_start(&paths));
    }

    #[test]
    fn test_docker_helper_install_and_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let helpers = helpers(dir.path());
        let docker_config = dir.path().join("home/.docker/config.json");
        std::fs::create_dir_all(docker_config.parent().unwrap()).unwrap();
        std::fs::write(&docker_config, r#"{"auths":{"ghcr.io":{}}}"#).unwrap();

        let features = ForwardingFeatures {
            docker_credentials: true,
            ..Default::default()
        };
        helpers.install(features).unwrap();

        let config: Value = serde_json::from_slice(&std::fs::read(&docker_config).unwrap()).unwrap();
        assert_eq!(config["credsStore"], "kled");
        assert!(config["auths"]["ghcr.io"].is_object());
        // replaced in place, no temp file left next to it
        let entries = std::fs::read_dir(docker_config.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);

        let shim = std::fs::read_to_string(dir.path().join("bin/docker-credential-kled")).unwrap();
        assert!(shim.contains("/opt/kled/kled agent docker-credentials --port 12049"));

        helpers.uninstall(features);
        let config: Value = serde_json::from_slice(&std::fs::read(&docker_config).unwrap()).unwrap();
        assert!(config.get("credsStore").is_none());
        assert!(!dir.path().join("bin/docker-credential-kled").exists());
    }

    #[test]
    fn test_docker_config_created_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let helpers = helpers(dir.path());
        let features = ForwardingFeatures {
            docker_credentials: true,
            ..Default::default()
        };
        helpers.install(features).unwrap();

        let docker_config = dir.path().join("home/.docker/config.json");
        let config: Value = serde_json::from_slice(&std::fs::read(&docker_config).unwrap()).unwrap();
        assert_eq!(config, serde_json::json!({ "credsStore": "kled" }));
    }

    #[test]
    fn test_disabled_features_install_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let helpers = helpers(dir.path());

        let warnings = helpers.install(ForwardingFeatures::default()).unwrap();
        assert!(warnings.is_empty());
        assert!(!dir.path().join("home/.docker").exists());
        assert!(!dir.path().join("bin").exists());
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("/usr/bin/kled"), "/usr/bin/kled");
        assert_eq!(sh_quote("it's here"), "'it'\\''s here'");
        assert_eq!(sh_quote(""), "''");
    }
}
