//! CLI command implementations.

pub mod agent;
pub mod helper;
pub mod machine;
pub mod pro;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use kled::config::{kled_home, KledConfig};
use kled::credentials::LocalCredentials;
use kled::orchestrator::{Orchestrator, ProviderConnector};
use kled::provider::{ProviderController, ProviderRegistry, RetryPolicy};
use kled::workspace::WorkspaceStore;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Run `fut` to completion on a fresh multi-threaded runtime.
pub fn block_on<F: std::future::Future>(fut: F) -> kled::Result<F::Output> {
    let runtime = tokio::runtime::Runtime::new()?;
    Ok(runtime.block_on(fut))
}

fn registry(config: &KledConfig) -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::from_config(config, &kled_home().join("providers")))
}

/// Provider controller for the configured providers.
pub fn controller(config: &KledConfig) -> ProviderController {
    ProviderController::new(registry(config), RetryPolicy::from(&config.retry))
}

/// Orchestrator over the configured providers and local credentials.
pub fn orchestrator(config: &KledConfig) -> Orchestrator {
    let registry = registry(config);
    Orchestrator::new(
        config.clone(),
        WorkspaceStore::open_default(),
        ProviderController::new(registry.clone(), RetryPolicy::from(&config.retry)),
        Arc::new(ProviderConnector::new(registry)),
        Arc::new(LocalCredentials::new()),
    )
}
