//! Workflow Validation
//!
//! Checks a workflow definition before instances are created from it:
//! - Task and condition field validation
//! - Unique task ids and unique condition ids per task
//! - Handler and evaluator references resolvable through a registry

use std::collections::HashSet;

use log::{debug, info, warn};

use super::model::{Task, Workflow};
use crate::execution::registry::HandlerRegistry;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyWorkflowId,
    DuplicateTaskId(String),
    EmptyTaskId,
    EmptyHandler(String),
    DuplicateConditionId { task: String, condition: String },
    EmptyEvaluator { task: String, condition: String },
    UnknownHandler { task: String, handler: String },
    UnknownEvaluator { task: String, evaluator: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no tasks"),
            Self::EmptyWorkflowId => write!(f, "Workflow has an empty id"),
            Self::DuplicateTaskId(id) => write!(f, "Duplicate task ID: '{}'", id),
            Self::EmptyTaskId => write!(f, "Task has empty or whitespace-only ID"),
            Self::EmptyHandler(task) => write!(f, "Task '{}' has no handler specified", task),
            Self::DuplicateConditionId { task, condition } => {
                write!(f, "Task '{}' declares condition '{}' twice", task, condition)
            }
            Self::EmptyEvaluator { task, condition } => {
                write!(f, "Task '{}': condition '{}' has no evaluator", task, condition)
            }
            Self::UnknownHandler { task, handler } => {
                write!(f, "Task '{}' uses unregistered handler '{}'", task, handler)
            }
            Self::UnknownEvaluator { task, evaluator } => {
                write!(f, "Task '{}' uses unregistered condition evaluator '{}'", task, evaluator)
            }
        }
    }
}

/// Validates a single task's fields.
fn validate_task(task: &Task) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if task.id.trim().is_empty() {
        errors.push(ValidationError::EmptyTaskId);
        return errors;
    }

    if task.handler.trim().is_empty() {
        errors.push(ValidationError::EmptyHandler(task.id.clone()));
    }

    let mut condition_ids = HashSet::new();
    for condition in &task.conditions {
        if !condition_ids.insert(condition.id.as_str()) {
            errors.push(ValidationError::DuplicateConditionId {
                task: task.id.clone(),
                condition: condition.id.clone(),
            });
        }
        if condition.evaluator.trim().is_empty() {
            errors.push(ValidationError::EmptyEvaluator {
                task: task.id.clone(),
                condition: condition.id.clone(),
            });
        }
    }

    let mut seen_fields = HashSet::new();
    for field in &task.required_metadata {
        if !seen_fields.insert(field.as_str()) {
            warn!("Task '{}' lists required metadata '{}' twice", task.id, field);
        }
    }

    if task.conditions.is_empty() {
        debug!("Task '{}' has no pre-conditions", task.id);
    }

    errors
}

/// Validates the workflow structure.
///
/// Performs the following checks:
/// 1. Workflow has an id and at least one task
/// 2. No duplicate task ids
/// 3. Every task has a handler, every condition an evaluator
/// 4. With a registry: every handler and evaluator is registered
pub fn validate_workflow(
    workflow: &Workflow,
    registry: Option<&HandlerRegistry>,
) -> Result<(), Vec<ValidationError>> {
    debug!("Validating workflow '{}' with {} tasks", workflow.id, workflow.tasks.len());

    if workflow.tasks.is_empty() {
        return Err(vec![ValidationError::EmptyWorkflow]);
    }

    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for task in &workflow.tasks {
        if !task.id.trim().is_empty() && !seen_ids.insert(task.id.as_str()) {
            errors.push(ValidationError::DuplicateTaskId(task.id.clone()));
        }

        errors.extend(validate_task(task));

        if let Some(registry) = registry {
            errors.extend(check_registered(task, registry));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    info!("Workflow '{}' validated: {} tasks", workflow.id, workflow.tasks.len());
    Ok(())
}

fn check_registered(task: &Task, registry: &HandlerRegistry) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !task.handler.is_empty() && !registry.has_handler(&task.handler) {
        errors.push(ValidationError::UnknownHandler {
            task: task.id.clone(),
            handler: task.handler.clone(),
        });
    }

    for condition in &task.conditions {
        if !condition.evaluator.is_empty() && !registry.has_condition(&condition.evaluator) {
            errors.push(ValidationError::UnknownEvaluator {
                task: task.id.clone(),
                evaluator: condition.evaluator.clone(),
            });
        }
    }

    errors
}

/// Joins validation errors into one message.
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
