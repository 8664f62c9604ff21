//! Workspace payload handed from hop to hop.
//!
//! The client serializes a [`WorkspaceInfo`] onto the host agent's argv
//! (`kled agent workspace up --workspace-info <json>`); the host agent fills
//! in the container details and passes it on to the container agent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::credentials::CredentialRequest;

/// Environment variable enabling git credential forwarding.
pub const ENV_GIT_CREDENTIALS: &str = "SSH_INJECT_GIT_CREDENTIALS";
/// Environment variable enabling docker credential forwarding.
pub const ENV_DOCKER_CREDENTIALS: &str = "SSH_INJECT_DOCKER_CREDENTIALS";
/// Environment variable enabling git SSH signature forwarding.
pub const ENV_GIT_SSH_SIGNATURE: &str = "GIT_SSH_SIGNATURE_FORWARDING";
/// Environment variable carrying the inactivity timeout.
pub const ENV_EXIT_AFTER_TIMEOUT: &str = "EXIT_AFTER_TIMEOUT";

/// Everything an inner hop needs to bring a workspace up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    /// Workspace ID (see `to_id`).
    pub id: String,
    /// Human name.
    pub name: String,
    pub source: WorkspaceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Devcontainer file relative to the source root, if not the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devcontainer_path: Option<String>,
    /// Resolved container configuration. Filled by the host agent when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
    #[serde(default)]
    pub features: ForwardingFeatures,
    /// Inactivity timeout; `None` disables the inactivity daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformAccess>,
    /// Folder SSH sessions start in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub session_mode: SessionMode,
    /// Command that serves one SSH session on stdio inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_server_command: Option<Vec<String>>,
    /// Leave the container running when the machine stops.
    #[serde(default)]
    pub keep_running: bool,
    /// Remove a partially started container when the hop is cancelled.
    #[serde(default)]
    pub cleanup_on_cancel: bool,
    /// Port of the in-container credentials server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_port: Option<u16>,
}

impl WorkspaceInfo {
    /// Minimal payload for a workspace built from `source`.
    pub fn new(id: impl Into<String>, source: WorkspaceSource) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source,
            machine_id: None,
            devcontainer_path: None,
            container: None,
            hooks: Vec::new(),
            features: ForwardingFeatures::default(),
            inactivity_timeout_secs: None,
            platform: None,
            workdir: None,
            session_mode: SessionMode::default(),
            ssh_server_command: None,
            keep_running: false,
            cleanup_on_cancel: false,
            credentials_port: None,
        }
    }

    /// Serialize for argv.
    pub fn to_arg(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from argv.
    pub fn from_arg(arg: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(arg)
    }
}

/// Where the workspace content comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkspaceSource {
    /// A git repository, optionally pinned to a branch, commit or PR ref.
    Git {
        remote: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    /// A folder already present on the machine.
    Local { path: PathBuf },
    /// A prebuilt image with no source tree.
    Image { image: String },
}

impl WorkspaceSource {
    /// Parse a user-supplied source string.
    ///
    /// `image:<ref>` selects an image, anything that looks like a URL or
    /// `host:path` is git (with an optional `@ref` suffix), the rest is a path.
    pub fn parse(raw: &str) -> Self {
        if let Some(image) = raw.strip_prefix("image:") {
            return WorkspaceSource::Image {
                image: image.to_string(),
            };
        }

        if looks_like_git(raw) {
            let (remote, reference) = split_git_ref(raw);
            return WorkspaceSource::Git {
                remote: remote.to_string(),
                reference: reference.map(str::to_string),
            };
        }

        WorkspaceSource::Local {
            path: PathBuf::from(raw),
        }
    }

    /// The string this source was parsed from (ID derivation input).
    pub fn display_string(&self) -> String {
        match self {
            WorkspaceSource::Git {
                remote,
                reference: Some(reference),
            } => format!("{}@{}", remote, reference),
            WorkspaceSource::Git { remote, .. } => remote.clone(),
            WorkspaceSource::Local { path } => path.display().to_string(),
            WorkspaceSource::Image { image } => image.clone(),
        }
    }
}

fn looks_like_git(raw: &str) -> bool {
    raw.starts_with("git@")
        || raw.starts_with("ssh://")
        || raw.starts_with("git://")
        || ((raw.starts_with("https://") || raw.starts_with("http://"))
            && !raw.ends_with(".tar.gz"))
        || raw.contains(".git@")
        || raw.ends_with(".git")
}

/// Split `remote@ref` without confusing the `git@host` user part for a ref.
fn split_git_ref(raw: &str) -> (&str, Option<&str>) {
    let search_from = if raw.starts_with("git@") { 4 } else { 0 };
    // the ref separator is the last '@' after the host part
    match raw[search_from..].rfind('@') {
        Some(pos) => {
            let pos = search_from + pos;
            let (remote, reference) = (&raw[..pos], &raw[pos + 1..]);
            if reference.is_empty() {
                (remote, None)
            } else {
                (remote, Some(reference))
            }
        }
        None => (raw, None),
    }
}

/// How the container image is produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Base or prebuilt image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Dockerfile path relative to the source root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build context relative to the source root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl BuildSpec {
    /// Whether an image must be built (as opposed to pulled as-is).
    pub fn needs_build(&self) -> bool {
        self.dockerfile.is_some()
    }
}

/// Resolved container configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub build: BuildSpec,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Where the source is mounted inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_folder: Option<String>,
}

/// A bind mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl MountSpec {
    /// Parse `source:target[:ro]`.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.splitn(3, ':');
        let source = parts.next().filter(|s| !s.is_empty())?;
        let target = parts.next().filter(|s| !s.is_empty())?;
        let read_only = matches!(parts.next(), Some("ro"));
        Some(Self {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

/// Point in the container lifecycle a hook runs at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    OnCreate,
    UpdateContent,
    PostCreate,
    PostStart,
    PostAttach,
}

impl HookPhase {
    /// Phases in execution order.
    pub const ALL: [HookPhase; 5] = [
        HookPhase::OnCreate,
        HookPhase::UpdateContent,
        HookPhase::PostCreate,
        HookPhase::PostStart,
        HookPhase::PostAttach,
    ];

    /// Devcontainer property name for this phase.
    pub fn property(&self) -> &'static str {
        match self {
            HookPhase::OnCreate => "onCreateCommand",
            HookPhase::UpdateContent => "updateContentCommand",
            HookPhase::PostCreate => "postCreateCommand",
            HookPhase::PostStart => "postStartCommand",
            HookPhase::PostAttach => "postAttachCommand",
        }
    }

    /// Whether the phase runs only once per container instance.
    pub fn once_per_container(&self) -> bool {
        matches!(
            self,
            HookPhase::OnCreate | HookPhase::UpdateContent | HookPhase::PostCreate
        )
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.property())
    }
}

/// A hook command: a shell string or an argv.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HookCommand {
    Shell(String),
    Exec(Vec<String>),
}

impl HookCommand {
    /// argv to execute.
    pub fn argv(&self) -> Vec<String> {
        match self {
            HookCommand::Shell(cmd) => vec!["/bin/sh".into(), "-c".into(), cmd.clone()],
            HookCommand::Exec(argv) => argv.clone(),
        }
    }
}

impl std::fmt::Display for HookCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookCommand::Shell(cmd) => f.write_str(cmd),
            HookCommand::Exec(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// One lifecycle hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    /// Label used in logs and warnings.
    pub name: String,
    pub phase: HookPhase,
    pub command: HookCommand,
    /// A failing required hook fails the bootstrap.
    #[serde(default)]
    pub required: bool,
}

/// Credential forwarding switches.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingFeatures {
    #[serde(default)]
    pub git_credentials: bool,
    #[serde(default)]
    pub docker_credentials: bool,
    #[serde(default)]
    pub git_ssh_signature: bool,
}

impl ForwardingFeatures {
    /// Read the switches from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the switches through `lookup`. Unset or falsy values disable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).map(|v| is_truthy(&v)).unwrap_or(false);
        Self {
            git_credentials: flag(ENV_GIT_CREDENTIALS),
            docker_credentials: flag(ENV_DOCKER_CREDENTIALS),
            git_ssh_signature: flag(ENV_GIT_SSH_SIGNATURE),
        }
    }

    /// Whether a request of this type may cross the transport.
    pub fn allows(&self, request: &CredentialRequest) -> bool {
        match request {
            CredentialRequest::Git { .. } => self.git_credentials,
            CredentialRequest::Docker { .. } | CredentialRequest::DockerList => {
                self.docker_credentials
            }
            CredentialRequest::SshSignature { .. } => self.git_ssh_signature,
        }
    }

    /// Whether any forwarding is enabled.
    pub fn any(&self) -> bool {
        self.git_credentials || self.docker_credentials || self.git_ssh_signature
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Managed-platform login data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformAccess {
    pub host: String,
    pub access_key: String,
    #[serde(default)]
    pub insecure: bool,
}

/// How the SSH serve loop accepts sessions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One session at a time (IDE use).
    #[default]
    Exclusive,
    /// Concurrent sessions sharing one SSH auth socket (browser IDEs).
    Shared,
}
