//! Container runtime on the target machine.
//!
//! The host agent only talks to the runtime through [`ContainerRuntime`];
//! [`DockerRuntime`] drives the docker CLI.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use kled_protocol::{HookSpec, MountSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Label carrying the workspace ID on every workspace container.
pub const WORKSPACE_LABEL: &str = "dev.containers.id";

/// Init script of a workspace container. The sleep runs in the background so
/// the TERM trap fires as soon as the signal arrives.
const KEEPALIVE_SCRIPT: &str =
    "trap 'kill $! 2>/dev/null; exit 0' TERM; while :; do sleep 1000 & wait $!; done";

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Building,
    Running,
    Stopped,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Building => write!(f, "building"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A workspace container found on the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub image: String,
    pub state: ContainerState,
}

/// The host agent's record of a workspace container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDescriptor {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout_secs: Option<u64>,
}

/// What to create a workspace container from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub workspace_id: String,
    pub image: String,
    pub mounts: Vec<MountSpec>,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Keeps the container alive; sessions are exec'd into it.
    pub command: Vec<String>,
}

impl RunSpec {
    pub fn new(workspace_id: impl Into<String>, image: impl Into<String>) -> Self {
        let workspace_id = workspace_id.into();
        let mut labels = BTreeMap::new();
        labels.insert(WORKSPACE_LABEL.to_string(), workspace_id.clone());
        Self {
            workspace_id,
            image: image.into(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            user: None,
            labels,
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                KEEPALIVE_SCRIPT.to_string(),
            ],
        }
    }
}

/// An image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub args: BTreeMap<String, String>,
    pub target: Option<String>,
    /// Tag applied to the result.
    pub tag: String,
}

/// Operations the host agent needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime is reachable.
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, reference: &str) -> Result<bool>;

    async fn pull(&self, reference: &str) -> Result<()>;

    /// Build an image. Returns the build log; failures are `Error::Build`.
    async fn build(&self, request: &BuildRequest) -> Result<String>;

    /// Find the container labelled with `workspace_id`.
    async fn find(&self, workspace_id: &str) -> Result<Option<ContainerStatus>>;

    /// Create a container. Returns its ID.
    async fn create(&self, spec: &RunSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Copy a host file into the container.
    async fn copy_into(&self, id: &str, source: &Path, dest: &str) -> Result<()>;

    /// argv that runs `command` in the container with stdio attached.
    fn exec_command(&self, id: &str, user: Option<&str>, command: &[String]) -> Vec<String>;
}
