//! In-memory instance repository.

use std::collections::HashMap;
use std::sync::RwLock;

use log::debug;

use super::{new_instance_id, InstanceRepository};
use crate::error::RepositoryError;
use crate::workflow::WorkflowInstance;

/// Keeps instances in a map for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryInstanceRepository {
    instances: RwLock<HashMap<String, WorkflowInstance>>,
}

impl MemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceRepository for MemoryInstanceRepository {
    fn add_workflow_instance(&self, instance: &mut WorkflowInstance) -> Result<String, RepositoryError> {
        let id = new_instance_id();
        instance.id = Some(id.clone());

        let mut instances = self.instances.write().map_err(|_| RepositoryError::Poisoned)?;
        instances.insert(id.clone(), instance.clone());
        debug!("Added workflow instance {}", id);

        Ok(id)
    }

    fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let id = instance.id.clone().ok_or(RepositoryError::MissingId)?;

        let mut instances = self.instances.write().map_err(|_| RepositoryError::Poisoned)?;
        match instances.get_mut(&id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(id)),
        }
    }

    fn get_workflow_instance_by_id(&self, id: &str) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(instances.get(id).cloned())
    }

    fn get_workflow_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.read().map_err(|_| RepositoryError::Poisoned)?;
        let mut all: Vec<WorkflowInstance> = instances.values().cloned().collect();
        all.sort_by_key(|inst| inst.created_at);
        Ok(all)
    }
}
