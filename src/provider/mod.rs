//! Machine providers.
//!
//! A provider creates, starts, stops and deletes the machine a workspace
//! container runs on, and knows how to run a command there (the host agent
//! hop). Providers are registered by name in a [`ProviderRegistry`] and
//! driven by the [`ProviderController`].

mod command;
mod controller;
mod local;
mod registry;
mod retry;
mod ssh;

pub use command::CommandProvider;
pub use controller::ProviderController;
pub use local::LocalProvider;
pub use registry::ProviderRegistry;
pub use retry::RetryPolicy;
pub use ssh::SshProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;

/// Provider-side machine state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MachineState {
    #[default]
    NotExist,
    Stopped,
    /// The provider is in the middle of a transition.
    Busy,
    Running,
}

impl MachineState {
    /// Parse the status line printed by provider commands.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "running" => Some(MachineState::Running),
            "stopped" => Some(MachineState::Stopped),
            "busy" => Some(MachineState::Busy),
            "notfound" | "notexist" | "not_found" | "not-found" => Some(MachineState::NotExist),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::NotExist => write!(f, "NotExist"),
            MachineState::Stopped => write!(f, "Stopped"),
            MachineState::Busy => write!(f, "Busy"),
            MachineState::Running => write!(f, "Running"),
        }
    }
}

/// A machine as last observed by the provider controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDescriptor {
    pub provider: String,
    pub id: String,
    #[serde(default)]
    pub state: MachineState,
    /// Provider-specific connection details (SSH endpoint and the like).
    #[serde(default)]
    pub connection: BTreeMap<String, String>,
}

impl MachineDescriptor {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
            state: MachineState::NotExist,
            connection: BTreeMap::new(),
        }
    }
}

/// The capability set every provider implements.
///
/// Lifecycle calls are expected to be idempotent where the backend allows
/// it; the controller only calls them when the observed state requires.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    async fn create(&self, machine: &MachineDescriptor) -> Result<(), ProviderError>;

    async fn start(&self, machine: &MachineDescriptor) -> Result<(), ProviderError>;

    async fn stop(&self, machine: &MachineDescriptor) -> Result<(), ProviderError>;

    async fn delete(&self, machine: &MachineDescriptor) -> Result<(), ProviderError>;

    async fn status(&self, machine: &MachineDescriptor) -> Result<MachineState, ProviderError>;

    /// argv that runs `command` on the machine with stdio attached.
    fn exec_command(
        &self,
        machine: &MachineDescriptor,
        command: &[String],
    ) -> Result<Vec<String>, ProviderError>;

    /// Whether the machine is this host, so the running binary can serve
    /// the agent hop.
    fn is_local(&self) -> bool {
        false
    }
}

/// Join argv into one shell-safe command line.
pub(crate) fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| kled_agent::setup::sh_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
