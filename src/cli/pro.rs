//! Managed platform login.
//!
//! `kled pro login` stores the platform access key in the config file. The
//! client passes it to every workspace container, where the container agent
//! runs the same command to log the container in.

use clap::{Args, Subcommand};
use kled::config::KledConfig;
use kled_protocol::PlatformAccess;

/// Managed platform access
#[derive(Subcommand, Debug)]
pub enum ProCmd {
    /// Log in to a platform instance
    Login(LoginCmd),

    /// Forget the stored platform login
    Logout,
}

impl ProCmd {
    pub fn run(self, config: &mut KledConfig) -> kled::Result<()> {
        match self {
            ProCmd::Login(cmd) => cmd.run(config),
            ProCmd::Logout => {
                if config.platform.take().is_some() {
                    config.save()?;
                }
                println!("Logged out");
                Ok(())
            }
        }
    }
}

#[derive(Args, Debug)]
pub struct LoginCmd {
    /// Platform host
    pub host: String,

    /// Access key
    #[arg(long)]
    pub access_key: String,

    /// Skip TLS verification
    #[arg(long)]
    pub insecure: bool,
}

impl LoginCmd {
    pub fn run(self, config: &mut KledConfig) -> kled::Result<()> {
        if self.access_key.trim().is_empty() {
            return Err(kled::Error::config("access key cannot be empty"));
        }
        config.platform = Some(PlatformAccess {
            host: self.host.clone(),
            access_key: self.access_key,
            insecure: self.insecure,
        });
        config.save()?;
        tracing::info!(host = %self.host, "platform login stored");
        println!("Logged in to {}", self.host);
        Ok(())
    }
}
