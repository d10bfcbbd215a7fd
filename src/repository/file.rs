//! JSON File Repository
//!
//! Stores each workflow instance as `{dir}/{instance_id}.json`, rewritten
//! after every update so a crashed process leaves the last known state
//! behind. Ids are limited to ASCII letters, digits, `-` and `_` so they
//! always name a file inside the directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};

use super::{new_instance_id, InstanceRepository};
use crate::error::RepositoryError;
use crate::workflow::WorkflowInstance;

/// File-backed instance repository.
#[derive(Debug)]
pub struct FileInstanceRepository {
    dir: PathBuf,
    // Serializes writers; readers go straight to disk
    write_lock: Mutex<()>,
}

impl FileInstanceRepository {
    /// Opens (and creates if needed) a repository directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Using instance repository at {}", dir.display());

        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn instance_path(&self, id: &str) -> Result<PathBuf, RepositoryError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            warn!("Rejecting workflow instance id {:?}", id);
            return Err(RepositoryError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn write(&self, id: &str, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let json = serde_json::to_string_pretty(instance)?;
        let path = self.instance_path(id)?;
        let tmp = path.with_extension("json.tmp");

        let _guard = self.write_lock.lock().map_err(|_| RepositoryError::Poisoned)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        debug!("Saved workflow instance state to {}", path.display());
        Ok(())
    }

    fn read(path: &Path) -> Result<WorkflowInstance, RepositoryError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl InstanceRepository for FileInstanceRepository {
    fn add_workflow_instance(&self, instance: &mut WorkflowInstance) -> Result<String, RepositoryError> {
        let id = new_instance_id();
        instance.id = Some(id.clone());
        self.write(&id, instance)?;
        Ok(id)
    }

    fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let id = instance.id.as_deref().ok_or(RepositoryError::MissingId)?;
        if !self.instance_path(id)?.exists() {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        self.write(id, instance)
    }

    fn get_workflow_instance_by_id(&self, id: &str) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let path = self.instance_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn get_workflow_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Skipping unreadable instance file {}: {}", path.display(), e),
            }
        }

        instances.sort_by_key(|inst| inst.created_at);
        Ok(instances)
    }
}
