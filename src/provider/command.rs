//! Provider driven by user-supplied shell commands.
//!
//! Covers cloud VMs, Kubernetes pods and kata sandboxes: anything whose
//! lifecycle can be expressed as a handful of commands.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{shell_join, MachineDescriptor, MachineState, Provider};
use crate::config::CommandProviderConfig;
use crate::error::{ProviderError, ProviderErrorKind};

/// Default limit for one provider command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// A provider whose operations are shell commands.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    config: CommandProviderConfig,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(name: impl Into<String>, config: CommandProviderConfig) -> Self {
        Self {
            name: name.into(),
            config,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn env(&self, machine: &MachineDescriptor) -> BTreeMap<String, String> {
        let mut env = self.config.env.clone();
        env.insert("MACHINE_ID".to_string(), machine.id.clone());
        env.insert("MACHINE_PROVIDER".to_string(), self.name.clone());
        for (key, value) in &machine.connection {
            env.insert(format!("MACHINE_{}", key.to_ascii_uppercase()), value.clone());
        }
        env
    }

    async fn run_optional(
        &self,
        operation: &str,
        script: Option<&String>,
        machine: &MachineDescriptor,
    ) -> Result<(), ProviderError> {
        match script {
            Some(script) => self.run(operation, script, machine).await.map(|_| ()),
            None => {
                tracing::debug!(provider = %self.name, operation, "no command configured, skipping");
                Ok(())
            }
        }
    }

    async fn run(
        &self,
        operation: &str,
        script: &str,
        machine: &MachineDescriptor,
    ) -> Result<String, ProviderError> {
        let argv = ["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
        run_command(&self.name, operation, &argv, &self.env(machine), self.timeout).await
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        self.run_optional("create", self.config.create.as_ref(), machine)
            .await
    }

    async fn start(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        self.run_optional("start", self.config.start.as_ref(), machine)
            .await
    }

    async fn stop(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        self.run_optional("stop", self.config.stop.as_ref(), machine)
            .await
    }

    async fn delete(&self, machine: &MachineDescriptor) -> Result<(), ProviderError> {
        self.run_optional("delete", self.config.delete.as_ref(), machine)
            .await
    }

    async fn status(&self, machine: &MachineDescriptor) -> Result<MachineState, ProviderError> {
        let output = self.run("status", &self.config.status, machine).await?;
        let line = output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        MachineState::parse(line).ok_or_else(|| {
            ProviderError::fatal(
                &self.name,
                "status",
                format!("unrecognized machine status '{}'", line.trim()),
            )
        })
    }

    fn exec_command(
        &self,
        machine: &MachineDescriptor,
        command: &[String],
    ) -> Result<Vec<String>, ProviderError> {
        let mut argv = vec!["env".to_string()];
        for (key, value) in self.env(machine) {
            argv.push(format!("{}={}", key, value));
        }
        argv.push(format!("KLED_COMMAND={}", shell_join(command)));
        argv.extend(["/bin/sh".to_string(), "-c".to_string(), self.config.exec.clone()]);
        Ok(argv)
    }
}

/// Run one provider command, capturing its output.
///
/// A non-zero exit is classified from the command output; exceeding
/// `timeout` is transient.
pub(crate) async fn run_command(
    provider: &str,
    operation: &str,
    argv: &[String],
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ProviderError::fatal(provider, operation, "empty command"));
    };

    tracing::debug!(provider, operation, command = ?argv, "running provider command");
    let child = Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ProviderError::fatal(
                provider,
                operation,
                format!("failed to run {}: {}", program, e),
            ))
        }
        Err(_) => {
            return Err(ProviderError::new(
                provider,
                operation,
                ProviderErrorKind::Transient,
                format!("timed out after {}s", timeout.as_secs()),
            ))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    Err(ProviderError::classify(
        provider,
        operation,
        format!("{} ({})", detail, output.status),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(status: &str) -> CommandProvider {
        CommandProvider::new(
            "cloud",
            CommandProviderConfig {
                create: Some("echo created".into()),
                start: None,
                stop: Some("echo 'instance does not exist' >&2; exit 1".into()),
                delete: Some("echo 'rate limit exceeded' >&2; exit 1".into()),
                status: status.into(),
                exec: "ssh -- \"$KLED_COMMAND\"".into(),
                env: BTreeMap::from([("REGION".to_string(), "eu-west-1".to_string())]),
            },
        )
    }

    #[tokio::test]
    async fn test_status_reads_last_line_with_env() {
        let machine = MachineDescriptor::new("cloud", "dev-1");
        let p = provider("echo checking $REGION; [ \"$MACHINE_ID\" = dev-1 ] && echo Stopped");
        assert_eq!(p.status(&machine).await.unwrap(), MachineState::Stopped);

        let p = provider("echo exploded");
        assert_eq!(
            p.status(&machine).await.unwrap_err().kind,
            ProviderErrorKind::Fatal
        );
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let machine = MachineDescriptor::new("cloud", "dev-1");
        let p = provider("echo Running");

        p.create(&machine).await.unwrap();
        // no start command configured
        p.start(&machine).await.unwrap();
        assert_eq!(
            p.stop(&machine).await.unwrap_err().kind,
            ProviderErrorKind::Inconsistent
        );
        assert_eq!(
            p.delete(&machine).await.unwrap_err().kind,
            ProviderErrorKind::Transient
        );
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let machine = MachineDescriptor::new("cloud", "dev-1");
        let p = provider("sleep 5").with_timeout(Duration::from_millis(50));
        assert!(p.status(&machine).await.unwrap_err().is_transient());
    }

    #[test]
    fn test_exec_command_carries_command() {
        let machine = MachineDescriptor::new("cloud", "dev-1");
        let argv = provider("true")
            .exec_command(&machine, &["kled".into(), "agent".into(), "--x=a b".into()])
            .unwrap();
        assert_eq!(argv[0], "env");
        assert!(argv.contains(&"MACHINE_ID=dev-1".to_string()));
        assert!(argv.contains(&"KLED_COMMAND=kled agent '--x=a b'".to_string()));
        assert_eq!(argv.last().unwrap(), "ssh -- \"$KLED_COMMAND\"");
    }
}
