//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating workflows, and the instance records the engine drives.
//!
//! # Structure
//!
//! - [`model`]: Static definitions (Workflow, Task, ConditionDef)
//! - [`metadata`]: Shared key/value context
//! - [`instance`]: Workflow instances and their lifecycle status
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules

pub mod instance;
pub mod metadata;
pub mod model;
pub mod parser;
pub mod validator;

pub use instance::{Priority, StatusCategory, WorkflowInstance, WorkflowStatus};
pub use metadata::Metadata;
pub use model::{ConditionDef, Task, TaskConfig, Workflow};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use validator::{validate_workflow, ValidationError};
