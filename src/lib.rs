//! kled - reproducible development workspaces on any backend.
//!
//! A workspace `up` runs as a chain of hops over one multiplexed stdio
//! transport:
//!
//! - the client ([`orchestrator`]) drives the machine through its
//!   [`provider`] and starts the host agent on it
//! - the host agent ([`agent`]) builds the image ([`build`]), starts the
//!   container through the [`runtime`] and starts the container agent
//! - the container agent (the `kled-agent` crate) runs setup and hooks and
//!   serves SSH sessions
//!
//! Credentials requested inside the container travel back up the same
//! transport and are resolved on the user's machine ([`credentials`]).

pub mod agent;
pub mod build;
pub mod config;
pub mod credentials;
pub mod devcontainer;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod runtime;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};

/// Version of kled.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
