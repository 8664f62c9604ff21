//! The local machine as a provider.
//!
//! There is nothing to provision: the machine is this host. Its lifecycle
//! state is bookkeeping in a state file so the controller sees the same
//! NotExist → Stopped → Running transitions as for remote machines.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{MachineDescriptor, MachineState, Provider};
use crate::error::ProviderError;

/// Provider name.
pub const LOCAL_PROVIDER: &str = "local";

/// The local machine.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    state_dir: PathBuf,
}

impl LocalProvider {
    /// Keep machine state files under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn state_file(&self, machine: &MachineDescriptor) -> PathBuf {
        self.state_dir.join(format!("{}.state", machine.id))
    }

    fn write_state(&self, path: &Path, state: MachineState, op: &str) -> Result<(), ProviderError> {
        std::fs::create_dir_all(&self.state_dir)
            .and_then(|_| std::fs::write(path, state.to_string()))
            .map_err(|e| ProviderError::fatal(LOCAL_PROVIDER, op, e.to_string()))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        LOCAL_PROVIDER
    }

    async fn create(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        let path = self.state_file(machine);
        if path.exists() {
            return Ok(());
        }
        self.write_state(&path, MachineState::Stopped, "create")
    }

    async fn start(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        let path = self.state_file(machine);
        if !path.exists() {
            return Err(ProviderError::new(
                LOCAL_PROVIDER,
                "start",
                crate::error::ProviderErrorKind::Inconsistent,
                format!("machine {} does not exist", machine.id),
            ));
        }
        self.write_state(&path, MachineState::Running, "start")
    }

    async fn stop(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        let path = self.state_file(machine);
        if !path.exists() {
            return Ok(());
        }
        self.write_state(&path, MachineState::Stopped, "stop")
    }

    async fn delete(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        match std::fs::remove_file(self.state_file(machine)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::fatal(LOCAL_PROVIDER, "delete", e.to_string())),
        }
    }

    async fn status(&self, machine: &MachineDescriptor) -> Result<MachineState, ProviderError> {
        match std::fs::read_to_string(self.state_file(machine)) {
            Ok(text) => MachineState::parse(&text).ok_or_else(|| {
                ProviderError::fatal(LOCAL_PROVIDER, "status", format!("corrupt state '{}'", text))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MachineState::NotExist),
            Err(e) => Err(ProviderError::fatal(LOCAL_PROVIDER, "status", e.to_string())),
        }
    }

    fn exec_command(
        &self,
        _machine: &MachineDescriptor,
        command: &[String],
    ) -> Result<Vec<String>, ProviderError> {
        Ok(command.to_vec())
    }

    fn is_local(&self) -> bool {
        true
    }
}
