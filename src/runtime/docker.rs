//! Docker CLI runtime.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{BuildRequest, ContainerRuntime, ContainerState, ContainerStatus, RunSpec, WORKSPACE_LABEL};
use crate::error::{Error, Result};

/// Runtime backed by the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(binary = %self.binary, ?args, "running container runtime");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::runtime(format!("failed to run {}: {}", self.binary, e)))
    }

    /// Run and return stdout, failing on a non-zero exit.
    async fn run(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(Error::runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Parse one `docker ps --format '{{.ID}}\t{{.Image}}\t{{.State}}'` line.
fn parse_ps_line(line: &str) -> Option<ContainerStatus> {
    let mut fields = line.trim().split('\t');
    let id = fields.next().filter(|s| !s.is_empty())?;
    let image = fields.next()?;
    let state = match fields.next()?.trim() {
        "running" | "restarting" => ContainerState::Running,
        "created" => ContainerState::Building,
        _ => ContainerState::Stopped,
    };
    Some(ContainerStatus {
        id: id.to_string(),
        image: image.to_string(),
        state,
    })
}

pub(crate) fn create_args(spec: &RunSpec) -> Vec<String> {
    let mut argv = args(["create"]);
    for (key, value) in &spec.labels {
        argv.push("--label".into());
        argv.push(format!("{}={}", key, value));
    }
    for (key, value) in &spec.env {
        argv.push("-e".into());
        argv.push(format!("{}={}", key, value));
    }
    for mount in &spec.mounts {
        let mut value = format!("type=bind,source={},target={}", mount.source, mount.target);
        if mount.read_only {
            value.push_str(",readonly");
        }
        argv.push("--mount".into());
        argv.push(value);
    }
    if let Some(user) = &spec.user {
        argv.push("-u".into());
        argv.push(user.clone());
    }
    argv.push(spec.image.clone());
    argv.extend(spec.command.iter().cloned());
    argv
}

pub(crate) fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut argv = args(["build", "-f"]);
    argv.push(request.dockerfile.display().to_string());
    argv.push("-t".into());
    argv.push(request.tag.clone());
    for (key, value) in &request.args {
        argv.push("--build-arg".into());
        argv.push(format!("{}={}", key, value));
    }
    if let Some(target) = &request.target {
        argv.push("--target".into());
        argv.push(target.clone());
    }
    argv.push(request.context.display().to_string());
    argv
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.run(&args(["version", "--format", "{{.Server.Version}}"]))
            .await
            .map(|_| ())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let output = self.output(&args(["image", "inspect", reference])).await?;
        Ok(output.status.success())
    }

    async fn pull(&self, reference: &str) -> Result<()> {
        self.run(&args(["pull", reference])).await.map(|_| ())
    }

    async fn build(&self, request: &BuildRequest) -> Result<String> {
        let output = self.output(&build_args(request)).await?;
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Error::Build {
                fingerprint: None,
                log,
            });
        }
        Ok(log)
    }

    async fn find(&self, workspace_id: &str) -> Result<Option<ContainerStatus>> {
        let filter = format!("label={}={}", WORKSPACE_LABEL, workspace_id);
        let stdout = self
            .run(&args([
                "ps",
                "-a",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.ID}}\t{{.Image}}\t{{.State}}",
            ]))
            .await?;
        Ok(stdout.lines().find_map(parse_ps_line))
    }

    async fn create(&self, spec: &RunSpec) -> Result<String> {
        let stdout = self.run(&create_args(spec)).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(Error::runtime("create returned no container id"));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&args(["start", id])).await.map(|_| ())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.run(&args(["stop", id])).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.run(&args(["rm", "-f", id])).await.map(|_| ())
    }

    async fn copy_into(&self, id: &str, source: &Path, dest: &str) -> Result<()> {
        let target = format!("{}:{}", id, dest);
        let source = source.display().to_string();
        self.run(&args(["cp", source.as_str(), target.as_str()])).await.map(|_| ())
    }

    fn exec_command(&self, id: &str, user: Option<&str>, command: &[String]) -> Vec<String> {
        let mut argv = vec![self.binary.clone(), "exec".to_string(), "-i".to_string()];
        if let Some(user) = user {
            argv.push("-u".to_string());
            argv.push(user.to_string());
        }
        argv.push(id.to_string());
        argv.extend(command.iter().cloned());
        argv
    }
}
