//! Lifecycle hook execution.
//!
//! Hooks run one after another in phase order. A failing hook is recorded
//! as a warning and the next hook still runs, unless the hook is marked
//! required, in which case the run stops with [`Error::Hook`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use kled_protocol::HookSpec;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Outcome of a hook run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HookReport {
    /// Names of hooks that ran successfully.
    pub ran: Vec<String>,
    /// One entry per failed non-required hook.
    pub warnings: Vec<String>,
}

/// Runs hooks in a fixed working directory and environment.
#[derive(Debug, Clone, Default)]
pub struct HookRunner {
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl HookRunner {
    pub fn new(workdir: Option<PathBuf>, env: BTreeMap<String, String>) -> Self {
        Self { workdir, env }
    }

    /// Run a single hook. The error is the failure message.
    pub async fn run(&self, hook: &HookSpec) -> std::result::Result<(), String> {
        let argv = hook.command.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err("empty command".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.workdir.as_ref().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }

        debug!(hook = %hook.name, command = %hook.command, "running hook");
        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to spawn '{}': {}", program, e))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(hook = %hook.name, "{}", line);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            info!(hook = %hook.name, stream = "stderr", "{}", line);
        }

        if output.status.success() {
            return Ok(());
        }

        let status = match output.status.code() {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        };
        match stderr.lines().last().filter(|l| !l.trim().is_empty()) {
            Some(last) => Err(format!("{}: {}", status, last.trim())),
            None => Err(status),
        }
    }

    /// Run `hooks` in phase order.
    ///
    /// Phases that only run once per container are skipped unless
    /// `first_start` is set. `on_start` is called before each hook runs.
    pub async fn run_all<F>(
        &self,
        hooks: &[HookSpec],
        first_start: bool,
        mut on_start: F,
    ) -> Result<HookReport>
    where
        F: FnMut(&HookSpec),
    {
        let mut ordered: Vec<&HookSpec> = hooks
            .iter()
            .filter(|h| first_start || !h.phase.once_per_container())
            .collect();
        ordered.sort_by_key(|h| h.phase);

        let mut report = HookReport::default();
        for hook in ordered {
            on_start(hook);
            match self.run(hook).await {
                Ok(()) => report.ran.push(hook.name.clone()),
                Err(message) if hook.required => {
                    return Err(Error::Hook {
                        name: hook.name.clone(),
                        message,
                    });
                }
                Err(message) => {
                    warn!(hook = %hook.name, error = %message, "hook failed, continuing");
                    report
                        .warnings
                        .push(format!("{} '{}' failed: {}", hook.phase, hook.name, message));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kled_protocol::{HookCommand, HookPhase};

    fn hook(name: &str, phase: HookPhase, cmd: &str, required: bool) -> HookSpec {
        HookSpec {
            name: name.to_string(),
            phase,
            command: HookCommand::Shell(cmd.to_string()),
            required,
        }
    }

    #[tokio::test]
    async fn test_failed_optional_hook_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let runner = HookRunner::new(Some(dir.path().to_path_buf()), BTreeMap::new());
        let hooks = vec![
            hook("broken", HookPhase::PostCreate, "echo oops >&2; exit 3", false),
            hook("after", HookPhase::PostStart, "touch after-ran", false),
        ];

        let report = runner.run_all(&hooks, true, |_| {}).await.unwrap();

        assert_eq!(report.ran, vec!["after"]);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("exited with code 3: oops"));
        assert!(dir.path().join("after-ran").exists());
    }

    #[tokio::test]
    async fn test_required_hook_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = HookRunner::new(Some(dir.path().to_path_buf()), BTreeMap::new());
        let hooks = vec![
            hook("must", HookPhase::OnCreate, "exit 1", true),
            hook("later", HookPhase::PostStart, "touch later-ran", false),
        ];

        let err = runner.run_all(&hooks, true, |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Hook { ref name, .. } if name == "must"));
        assert!(!dir.path().join("later-ran").exists());
    }

    #[tokio::test]
    async fn test_once_per_container_phases_skipped_on_restart() {
        let runner = HookRunner::default();
        let hooks = vec![
            hook("create", HookPhase::OnCreate, "true", false),
            hook("start", HookPhase::PostStart, "true", false),
        ];

        let mut started = Vec::new();
        let report = runner
            .run_all(&hooks, false, |h| started.push(h.name.clone()))
            .await
            .unwrap();

        assert_eq!(started, vec!["start"]);
        assert_eq!(report.ran, vec!["start"]);
    }

    #[tokio::test]
    async fn test_phase_order_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let runner = HookRunner::new(Some(dir.path().to_path_buf()), env);
        let hooks = vec![
            hook("second", HookPhase::PostStart, "echo second >> order", false),
            hook("first", HookPhase::OnCreate, "echo $GREETING >> order", false),
        ];

        runner.run_all(&hooks, true, |_| {}).await.unwrap();

        let order = std::fs::read_to_string(dir.path().join("order")).unwrap();
        assert_eq!(order, "hi\nsecond\n");
    }
}
