//! Instance Repository
//!
//! Persistence of workflow instances. The engine writes every state
//! transition through an [`InstanceRepository`]; two implementations are
//! bundled:
//!
//! - [`MemoryInstanceRepository`]: process-local, used by default and in tests
//! - [`FileInstanceRepository`]: one JSON document per instance on disk

pub mod file;
pub mod memory;

pub use file::FileInstanceRepository;
pub use memory::MemoryInstanceRepository;

use crate::error::RepositoryError;
use crate::workflow::WorkflowInstance;

/// Storage for workflow instances.
///
/// Implementations are shared between the engine and every driver thread.
pub trait InstanceRepository: Send + Sync {
    /// Stores a new instance, assigning and returning its id.
    fn add_workflow_instance(&self, instance: &mut WorkflowInstance) -> Result<String, RepositoryError>;

    /// Overwrites a stored instance.
    fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError>;

    fn get_workflow_instance_by_id(&self, id: &str) -> Result<Option<WorkflowInstance>, RepositoryError>;

    fn get_workflow_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError>;
}

/// Adds the instance when it has no id yet, updates it otherwise.
pub fn persist(repository: &dyn InstanceRepository, instance: &mut WorkflowInstance) -> Result<(), RepositoryError> {
    if instance.id.as_deref().map_or(true, str::is_empty) {
        repository.add_workflow_instance(instance)?;
        Ok(())
    } else {
        repository.update_workflow_instance(instance)
    }
}

/// Fresh repository-assigned instance id.
pub(crate) fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
