//! Managed-platform access setup.
//!
//! A platform-authenticated user gets the platform CLI logged in inside the
//! container, plus the optional cluster CLIs when they are installed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use kled_protocol::PlatformAccess;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Optional CLIs that accept the same access key.
const OPTIONAL_CLIS: [&str; 2] = ["vcluster", "kcluster"];

/// Plans and runs the platform login commands.
#[derive(Debug, Clone)]
pub struct PlatformLogin {
    /// The kled binary inside the container.
    cli: PathBuf,
    /// `PATH` searched for the optional CLIs.
    search_path: Option<OsString>,
}

impl PlatformLogin {
    pub fn new(cli: impl Into<PathBuf>) -> Self {
        Self {
            cli: cli.into(),
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Search `path` instead of the process `PATH`.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Commands to run, in order. Missing optional CLIs are left out.
    pub fn plan(&self, access: &PlatformAccess) -> Vec<Vec<String>> {
        let mut login = vec![
            self.cli.display().to_string(),
            "pro".to_string(),
            "login".to_string(),
            "--access-key".to_string(),
            access.access_key.clone(),
        ];
        if access.insecure {
            login.push("--insecure".to_string());
        }
        login.push(access.host.clone());

        let mut commands = vec![login];
        for name in OPTIONAL_CLIS {
            match self.find(name) {
                Some(path) => commands.push(vec![
                    path.display().to_string(),
                    "login".to_string(),
                    access.host.clone(),
                    "--access-key".to_string(),
                    access.access_key.clone(),
                ]),
                None => debug!(cli = name, "not installed, skipping login"),
            }
        }
        commands
    }

    /// Run the planned commands. The first failure stops the setup.
    pub async fn run(&self, access: &PlatformAccess) -> Result<()> {
        for argv in self.plan(access) {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let name = Path::new(program)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| program.clone());

            let output = Command::new(program)
                .args(args)
                .stdin(std::process::Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                return Err(Error::Setup(format!(
                    "{} login failed: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            info!(cli = %name, host = %access.host, "platform login complete");
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        let search = self.search_path.as_ref()?;
        which::which_in(name, Some(search), "/").ok()
    }
}
