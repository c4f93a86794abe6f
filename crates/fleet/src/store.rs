//! Configuration store: the ordered `NodeSpec` array as a JSON file.
//!
//! `save` writes a sibling temp file, syncs it and renames it over the
//! target, so a crash never leaves a half-written fleet file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::FleetError;
use crate::model::{validate_fleet, NodeSpec};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and validates the fleet.
    pub fn load(&self) -> Result<Vec<NodeSpec>, FleetError> {
        let raw = fs::read(&self.path).map_err(|e| FleetError::io(&self.path, e))?;
        let nodes: Vec<NodeSpec> =
            serde_json::from_slice(&raw).map_err(|e| FleetError::json(&self.path, e))?;
        validate_fleet(&nodes)?;
        debug!(path = %self.path.display(), nodes = nodes.len(), "fleet loaded");
        Ok(nodes)
    }

    /// Atomically replaces the stored fleet.
    pub fn save(&self, nodes: &[NodeSpec]) -> Result<(), FleetError> {
        let mut bytes =
            serde_json::to_vec_pretty(nodes).map_err(|e| FleetError::json(&self.path, e))?;
        bytes.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| FleetError::io(parent, e))?;
        }

        let tmp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.flush()?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(FleetError::io(&self.path, e));
        }
        debug!(path = %self.path.display(), nodes = nodes.len(), "fleet saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
