//! Provider lookup by name.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::local::LOCAL_PROVIDER;
use super::{CommandProvider, LocalProvider, Provider, SshProvider};
use crate::config::{KledConfig, ProviderConfig};
use crate::error::{Error, Result};

/// Registered providers, resolved once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration.
    ///
    /// The local provider is always present; configured providers may
    /// replace it.
    pub fn from_config(config: &KledConfig, state_dir: &Path) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalProvider::new(state_dir.join("local"))));

        for (name, provider) in &config.providers {
            let provider: Arc<dyn Provider> = match provider {
                ProviderConfig::Local => Arc::new(LocalProvider::new(state_dir.join(name))),
                ProviderConfig::Ssh {
                    host,
                    user,
                    port,
                    identity_file,
                } => Arc::new(
                    SshProvider::new(name, host)
                        .with_user(user.clone())
                        .with_port(*port)
                        .with_identity_file(identity_file.clone()),
                ),
                ProviderConfig::Command(commands) => {
                    Arc::new(CommandProvider::new(name, commands.clone()))
                }
            };
            registry.insert(name, provider);
        }
        registry
    }

    /// Register `provider` under its own name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        self.insert(&name, provider);
    }

    fn insert(&mut self, name: &str, provider: Arc<dyn Provider>) {
        if self.providers.insert(name.to_string(), provider).is_some() {
            tracing::debug!(provider = %name, "provider replaced");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn has_local(&self) -> bool {
        self.providers.contains_key(LOCAL_PROVIDER)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
