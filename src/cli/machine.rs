//! Machine lifecycle commands.
//!
//! These drive a provider directly, without any workspace on top. Each
//! command is idempotent: asking for a state the machine is already in
//! does nothing.

use clap::{Args, Subcommand};
use kled::config::KledConfig;
use kled::provider::{MachineDescriptor, MachineState};
use kled::workspace::WorkspaceStore;

use super::{block_on, controller};

/// Manage provider machines
#[derive(Subcommand, Debug)]
pub enum MachineCmd {
    /// Create a machine without starting it
    Create(MachineArgs),

    /// Start a machine, creating it if needed
    Start(MachineArgs),

    /// Stop a machine
    Stop(MachineArgs),

    /// Delete a machine
    #[command(alias = "rm")]
    Delete(MachineArgs),

    /// Show a machine's state
    Status(MachineArgs),
}

#[derive(Args, Debug)]
pub struct MachineArgs {
    /// Machine ID
    pub name: String,

    /// Provider (defaults to the recorded one, then the configured default)
    #[arg(long)]
    pub provider: Option<String>,
}

impl MachineArgs {
    fn descriptor(&self, store: &WorkspaceStore, config: &KledConfig) -> kled::Result<MachineDescriptor> {
        let mut machine = store
            .load_machine(&self.name)?
            .unwrap_or_else(|| MachineDescriptor::new(&config.default_provider, &self.name));
        if let Some(provider) = &self.provider {
            machine.provider = provider.clone();
        }
        Ok(machine)
    }
}

impl MachineCmd {
    pub fn run(self, config: &KledConfig) -> kled::Result<()> {
        let store = WorkspaceStore::open_default();
        let controller = controller(config);

        block_on(async move {
            match self {
                MachineCmd::Create(args) => {
                    let mut machine = args.descriptor(&store, config)?;
                    let state = controller.status(&machine).await?;
                    if state == MachineState::NotExist {
                        let provider = controller.registry().get(&machine.provider)?;
                        provider.create(&machine).await?;
                        machine.state = MachineState::Stopped;
                    } else {
                        machine.state = state;
                    }
                    store.save_machine(&machine)?;
                    println!("{}", machine.id);
                }
                MachineCmd::Start(args) => {
                    let machine = controller
                        .ensure_machine(&args.descriptor(&store, config)?)
                        .await?;
                    store.save_machine(&machine)?;
                    println!("{}", machine.id);
                }
                MachineCmd::Stop(args) => {
                    let machine = controller
                        .stop_machine(&args.descriptor(&store, config)?)
                        .await?;
                    store.save_machine(&machine)?;
                    println!("{}", machine.id);
                }
                MachineCmd::Delete(args) => {
                    let machine = controller
                        .delete_machine(&args.descriptor(&store, config)?)
                        .await?;
                    store.delete_machine(&machine.id)?;
                    println!("{}", machine.id);
                }
                MachineCmd::Status(args) => {
                    let state = controller.status(&args.descriptor(&store, config)?).await?;
                    println!("{}", state);
                }
            }
            Ok::<(), kled::Error>(())
        })?
    }
}
