//! A pre-existing host reachable over SSH.
//!
//! kled does not manage the host's lifecycle: create, start, stop and
//! delete are no-ops, and status is a reachability probe.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::command::run_command;
use super::{shell_join, MachineDescriptor, MachineState, Provider};
use crate::error::ProviderError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// An SSH-reachable host.
#[derive(Debug, Clone)]
pub struct SshProvider {
    name: String,
    host: String,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
}

impl SshProvider {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, identity_file: Option<PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "ssh".to_string(),
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(port) = self.port {
            argv.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(identity) = &self.identity_file {
            argv.extend(["-i".to_string(), identity.display().to_string()]);
        }
        argv.push(self.destination());
        argv
    }
}

#[async_trait]
impl Provider for SshProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn start(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn stop(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn delete(&self, _machine: &MachineDescriptor) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn status(&self, _machine: &MachineDescriptor) -> Result<MachineState, ProviderError> {
        let mut argv = self.ssh_argv();
        argv.push("true".to_string());
        run_command(&self.name, "status", &argv, &BTreeMap::new(), PROBE_TIMEOUT).await?;
        Ok(MachineState::Running)
    }

    fn exec_command(
        &self,
        _machine: &MachineDescriptor,
        command: &[String],
    ) -> Result<Vec<String>, ProviderError> {
        let mut argv = self.ssh_argv();
        argv.push(shell_join(command));
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_command() {
        let provider = SshProvider::new("devbox", "devbox.internal")
            .with_user(Some("dev".into()))
            .with_port(Some(2222));
        let machine = MachineDescriptor::new("devbox", "devbox");
        let argv = provider
            .exec_command(&machine, &["kled".into(), "agent".into(), "{\"a\": 1}".into()])
            .unwrap();

        assert_eq!(argv[0], "ssh");
        assert!(argv.windows(2).any(|w| w == ["-p", "2222"]));
        assert_eq!(argv[argv.len() - 2], "dev@devbox.internal");
        assert_eq!(argv[argv.len() - 1], "kled agent '{\"a\": 1}'");
    }
}
