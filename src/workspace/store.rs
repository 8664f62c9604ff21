//! Local persistence of workspace and machine descriptors.
//!
//! Layout under the kled home:
//! - `workspaces/<name>/workspace.json`
//! - `machines/<id>/machine.json`

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::provider::MachineDescriptor;
use crate::util::{read_json, write_json};

use super::WorkspaceDescriptor;

const WORKSPACE_FILE: &str = "workspace.json";
const MACHINE_FILE: &str = "machine.json";

/// File-backed store for descriptors.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the kled home directory.
    pub fn open_default() -> Self {
        Self::new(crate::config::kled_home())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace_dir(&self, name: &str) -> PathBuf {
        self.root.join("workspaces").join(name)
    }

    fn machine_dir(&self, id: &str) -> PathBuf {
        self.root.join("machines").join(id)
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    pub fn save_workspace(&self, workspace: &WorkspaceDescriptor) -> Result<()> {
        write_json(
            &self.workspace_dir(&workspace.name).join(WORKSPACE_FILE),
            workspace,
        )
    }

    pub fn load_workspace(&self, name: &str) -> Result<Option<WorkspaceDescriptor>> {
        read_json(&self.workspace_dir(name).join(WORKSPACE_FILE))
    }

    /// Load a workspace that must exist.
    pub fn workspace(&self, name: &str) -> Result<WorkspaceDescriptor> {
        self.load_workspace(name)?
            .ok_or_else(|| Error::WorkspaceNotFound(name.to_string()))
    }

    /// All workspaces, sorted by name. Unreadable entries are skipped.
    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceDescriptor>> {
        let dir = self.root.join("workspaces");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut workspaces = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            match self.load_workspace(&name) {
                Ok(Some(ws)) => workspaces.push(ws),
                Ok(None) => {}
                Err(e) => tracing::warn!(workspace = %name, error = %e, "skipping unreadable workspace"),
            }
        }
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workspaces)
    }

    /// Remove a workspace's state. Missing workspaces are not an error.
    pub fn delete_workspace(&self, name: &str) -> Result<()> {
        remove_dir(&self.workspace_dir(name))
    }

    // =========================================================================
    // Machines
    // =========================================================================

    pub fn save_machine(&self, machine: &MachineDescriptor) -> Result<()> {
        write_json(&self.machine_dir(&machine.id).join(MACHINE_FILE), machine)
    }

    pub fn load_machine(&self, id: &str) -> Result<Option<MachineDescriptor>> {
        read_json(&self.machine_dir(id).join(MACHINE_FILE))
    }

    pub fn delete_machine(&self, id: &str) -> Result<()> {
        remove_dir(&self.machine_dir(id))
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MachineState;

    #[test]
    fn test_workspace_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path());

        let mut b = WorkspaceDescriptor::new("github.com/org/beta", None, "local").unwrap();
        b.machine_id = Some("beta".into());
        let a = WorkspaceDescriptor::new("github.com/org/alpha", None, "ssh").unwrap();
        store.save_workspace(&b).unwrap();
        store.save_workspace(&a).unwrap();

        assert!(dir.path().join("workspaces/beta/workspace.json").exists());
        assert_eq!(store.workspace("beta").unwrap(), b);

        let names: Vec<_> = store
            .list_workspaces()
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        store.delete_workspace("beta").unwrap();
        store.delete_workspace("beta").unwrap();
        assert!(matches!(
            store.workspace("beta"),
            Err(Error::WorkspaceNotFound(_))
        ));
    }

    #[test]
    fn test_machine_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path());

        let mut machine = MachineDescriptor::new("local", "demo");
        machine.state = MachineState::Running;
        store.save_machine(&machine).unwrap();

        assert!(dir.path().join("machines/demo/machine.json").exists());
        assert_eq!(store.load_machine("demo").unwrap(), Some(machine));
        store.delete_machine("demo").unwrap();
        assert_eq!(store.load_machine("demo").unwrap(), None);
    }
}
