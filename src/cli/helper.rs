//! Helper processes.

use clap::{Args, Subcommand};
use kled_agent::paths::AgentPaths;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Directories searched for `sshd` besides `PATH`.
const SSHD_DIRS: [&str; 2] = ["/usr/sbin", "/usr/local/sbin"];

/// Helper processes
#[derive(Subcommand, Debug)]
pub enum HelperCmd {
    /// SSH server speaking on stdin/stdout
    SshServer(SshServerCmd),
}

impl HelperCmd {
    pub fn run(self) -> kled::Result<()> {
        match self {
            HelperCmd::SshServer(cmd) => cmd.run(),
        }
    }
}

#[derive(Args, Debug)]
pub struct SshServerCmd {
    /// Serve a single connection on stdin/stdout
    #[arg(long)]
    pub stdio: bool,

    /// Host key (generated when missing)
    #[arg(long)]
    pub host_key: Option<PathBuf>,
}

impl SshServerCmd {
    /// Replace this process with `sshd -i`.
    pub fn run(self) -> kled::Result<()> {
        if !self.stdio {
            return Err(kled::Error::config("only --stdio mode is supported"));
        }
        let host_key = self
            .host_key
            .unwrap_or_else(|| AgentPaths::from_env().data_dir().join("ssh_host_ed25519_key"));
        ensure_host_key(&host_key)?;

        let sshd = find_sshd(std::env::var_os("PATH"))
            .ok_or_else(|| kled::Error::runtime("sshd not found"))?;
        tracing::debug!(sshd = %sshd.display(), "starting ssh server on stdio");
        let err = Command::new(&sshd)
            .args(sshd_args(&host_key))
            .exec();
        Err(kled::Error::runtime(format!(
            "failed to exec {}: {}",
            sshd.display(),
            err
        )))
    }
}

fn sshd_args(host_key: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        "-e".to_string(),
        "-o".to_string(),
        format!("HostKey={}", host_key.display()),
        "-o".to_string(),
        "PidFile=none".to_string(),
        "-o".to_string(),
        "PermitUserEnvironment=yes".to_string(),
    ]
}

fn ensure_host_key(path: &Path) -> kled::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let status = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-f"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .map_err(|e| kled::Error::runtime(format!("failed to run ssh-keygen: {}", e)))?;
    if !status.success() {
        return Err(kled::Error::runtime(format!(
            "ssh-keygen exited with {}",
            status
        )));
    }
    Ok(())
}

/// Look for sshd on `path`, then in the sbin directories a login PATH has.
fn find_sshd(path: Option<OsString>) -> Option<PathBuf> {
    let path = path.unwrap_or_default();
    let dirs = std::env::split_paths(&path).chain(SSHD_DIRS.iter().map(PathBuf::from));
    let search = std::env::join_paths(dirs).ok()?;
    which::which_in("sshd", Some(search), "/").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sshd_args() {
        let args = sshd_args(Path::new("/var/lib/kled-agent/key"));
        assert_eq!(args[0], "-i");
        assert!(args.contains(&"HostKey=/var/lib/kled-agent/key".to_string()));
    }

    #[test]
    fn test_find_sshd_skips_non_executable() {
        use std::os::unix::fs::PermissionsExt;

        let plain = tempfile::tempdir().unwrap();
        std::fs::write(plain.path().join("sshd"), "").unwrap();
        let bin = tempfile::tempdir().unwrap();
        let sshd = bin.path().join("sshd");
        std::fs::write(&sshd, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&sshd, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = std::env::join_paths([plain.path(), bin.path()]).unwrap();
        assert_eq!(find_sshd(Some(path)), Some(sshd));
    }
}
