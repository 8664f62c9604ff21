//! Machine lifecycle driven towards a target state.
//!
//! Every operation reads the machine's status first and only calls the
//! provider when the target is not already reached, so repeated calls are
//! no-ops. Transient failures are retried by the [`RetryPolicy`]; an
//! inconsistent failure (the machine changed between status and action)
//! re-reads status and tries once more.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{MachineDescriptor, MachineState, Provider, ProviderRegistry, RetryPolicy};
use crate::error::{Error, ProviderError, ProviderErrorKind, Result};

/// Poll interval while a machine is Busy.
pub const DEFAULT_BUSY_POLL: Duration = Duration::from_secs(5);

/// Longest wait for a Busy machine to settle.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    Running,
    Stopped,
    Deleted,
}

impl Goal {
    fn reached(self, state: MachineState) -> bool {
        match self {
            Goal::Running => state == MachineState::Running,
            Goal::Stopped => matches!(state, MachineState::Stopped | MachineState::NotExist),
            Goal::Deleted => state == MachineState::NotExist,
        }
    }

    fn state(self) -> MachineState {
        match self {
            Goal::Running => MachineState::Running,
            Goal::Stopped => MachineState::Stopped,
            Goal::Deleted => MachineState::NotExist,
        }
    }
}

/// Drives machines through their providers.
#[derive(Debug, Clone)]
pub struct ProviderController {
    registry: Arc<ProviderRegistry>,
    retry: RetryPolicy,
    busy_poll: Duration,
    busy_timeout: Duration,
}

impl ProviderController {
    pub fn new(registry: Arc<ProviderRegistry>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            retry,
            busy_poll: DEFAULT_BUSY_POLL,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_wait(mut self, poll: Duration, timeout: Duration) -> Self {
        self.busy_poll = poll;
        self.busy_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Make sure the machine exists and is running.
    pub async fn ensure_machine(&self, machine: &MachineDescriptor) -> Result<MachineDescriptor> {
        self.drive(machine, Goal::Running).await
    }

    /// Stop the machine. A stopped or missing machine is left alone.
    pub async fn stop_machine(&self, machine: &MachineDescriptor) -> Result<MachineDescriptor> {
        self.drive(machine, Goal::Stopped).await
    }

    /// Delete the machine. A missing machine is left alone.
    pub async fn delete_machine(&self, machine: &MachineDescriptor) -> Result<MachineDescriptor> {
        self.drive(machine, Goal::Deleted).await
    }

    /// Read the machine's current state.
    pub async fn status(&self, machine: &MachineDescriptor) -> Result<MachineState> {
        let provider = self.registry.get(&machine.provider)?;
        Ok(self.retry.run(|| provider.status(machine)).await?)
    }

    async fn drive(&self, machine: &MachineDescriptor, goal: Goal) -> Result<MachineDescriptor> {
        let provider = self.registry.get(&machine.provider)?;
        let mut machine = machine.clone();
        let mut refreshed = false;
        let busy_deadline = Instant::now() + self.busy_timeout;

        loop {
            let state = self.retry.run(|| provider.status(&machine)).await?;
            machine.state = state;

            if goal.reached(state) {
                debug!(machine = %machine.id, state = %state, "machine already in target state");
                return Ok(machine);
            }

            if state == MachineState::Busy {
                if Instant::now() >= busy_deadline {
                    return Err(Error::InvalidState {
                        expected: goal.state().to_string(),
                        actual: state.to_string(),
                    });
                }
                debug!(machine = %machine.id, "machine busy, waiting");
                tokio::time::sleep(self.busy_poll).await;
                continue;
            }

            match self.transition(provider.as_ref(), &machine, goal).await {
                Ok(()) => {
                    info!(
                        machine = %machine.id,
                        provider = %machine.provider,
                        from = %state,
                        to = %goal.state(),
                        "machine transition"
                    );
                    machine.state = goal.state();
                    return Ok(machine);
                }
                Err(e) if e.kind == ProviderErrorKind::Inconsistent && !refreshed => {
                    warn!(
                        machine = %machine.id,
                        error = %e.message,
                        "machine changed underneath, refreshing status"
                    );
                    refreshed = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn transition(
        &self,
        provider: &dyn Provider,
        machine: &MachineDescriptor,
        goal: Goal,
    ) -> std::result::Result<(), ProviderError> {
        match (goal, machine.state) {
            (Goal::Running, MachineState::NotExist) => {
                self.retry.run(|| provider.create(machine)).await?;
                self.retry.run(|| provider.start(machine)).await
            }
            (Goal::Running, _) => self.retry.run(|| provider.start(machine)).await,
            (Goal::Stopped, _) => self.retry.run(|| provider.stop(machine)).await,
            (Goal::Deleted, _) => self.retry.run(|| provider.delete(machine)).await,
        }
    }
}
