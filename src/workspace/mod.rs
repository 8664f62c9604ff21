//! Workspace descriptors and their local state.

pub mod id;
mod store;

pub use id::to_id;
pub use store::WorkspaceStore;

use kled_protocol::WorkspaceSource;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum workspace name length.
pub const MAX_NAME_LEN: usize = 64;

/// A workspace as the client knows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDescriptor {
    /// Unique ID, derived from the source unless named explicitly.
    pub id: String,
    pub name: String,
    pub source: WorkspaceSource,
    /// Provider the workspace runs on.
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devcontainer_path: Option<String>,
    /// Machine backing the workspace, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Last container reported ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Last image the container ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: u64,
    pub last_used: u64,
}

impl WorkspaceDescriptor {
    /// New descriptor for `source` on `provider`.
    ///
    /// The name defaults to the ID derived from the source.
    pub fn new(source: &str, name: Option<&str>, provider: &str) -> Result<Self> {
        let id = match name {
            Some(name) => {
                validate_name(name)?;
                name.to_string()
            }
            None => to_id(source),
        };
        if id.is_empty() {
            return Err(Error::config(format!(
                "cannot derive a workspace name from '{}', pass one explicitly",
                source
            )));
        }

        let now = crate::util::now_secs();
        Ok(Self {
            name: id.clone(),
            id,
            source: WorkspaceSource::parse(source),
            provider: provider.to_string(),
            devcontainer_path: None,
            machine_id: None,
            container_id: None,
            image: None,
            created_at: now,
            last_used: now,
        })
    }

    /// Record a use of the workspace.
    pub fn touch(&mut self) {
        self.last_used = crate::util::now_secs();
    }
}

/// Validate a workspace name.
///
/// Rules:
/// - Length: 1..=64 characters
/// - Allowed characters: lowercase alphanumeric and hyphen (-)
/// - Must start with a letter or digit
/// - Cannot end with a hyphen
pub fn validate_name(name: &str) -> Result<()> {
    let first = name
        .chars()
        .next()
        .ok_or_else(|| Error::config("workspace name cannot be empty"))?;

    if name.len() > MAX_NAME_LEN {
        return Err(Error::config(format!(
            "workspace name too long: {} characters (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if !first.is_ascii_alphanumeric() {
        return Err(Error::config(
            "workspace name must start with a letter or digit",
        ));
    }
    if name.ends_with('-') {
        return Err(Error::config("workspace name cannot end with a hyphen"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(Error::config(format!(
            "workspace name contains invalid character: '{}'",
            c
        )));
    }
    Ok(())
}
