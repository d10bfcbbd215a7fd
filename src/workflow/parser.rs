//! Workflow Parser
//!
//! Loads workflow definitions from YAML files and normalizes them before
//! they reach the engine.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Workflow;
use super::validator::{describe, validate_workflow};
use crate::error::{EngineError, Result};

/// Fills blank task and condition names with their ids.
fn apply_default_names(workflow: &mut Workflow) {
    if workflow.name.trim().is_empty() {
        workflow.name = workflow.id.clone();
    }

    for task in &mut workflow.tasks {
        task.id = task.id.trim().to_string();
        task.handler = task.handler.trim().to_string();
        if task.name.trim().is_empty() {
            task.name = task.id.clone();
        }

        for condition in &mut task.conditions {
            if condition.name.trim().is_empty() {
                condition.name = condition.id.clone();
            }
        }
    }
}

/// Parses a workflow from YAML text.
///
/// Names default to ids and the result is structurally validated. Handler
/// references are checked later, when the engine starts an instance.
pub fn parse_workflow(yaml_content: &str) -> Result<Workflow> {
    let mut workflow: Workflow = serde_yaml::from_str(yaml_content)?;

    apply_default_names(&mut workflow);

    validate_workflow(&workflow, None).map_err(|errors| EngineError::Validation(describe(&errors)))?;

    Ok(workflow)
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), flowrunner::EngineError> {
///     let workflow = load_workflow("ingest.yaml")?;
///     println!("Loaded {} tasks", workflow.tasks.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path)?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let workflow = parse_workflow(&yaml_content)?;
    info!("Parsed workflow '{}' with {} tasks", workflow.id, workflow.tasks.len());

    Ok(workflow)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &Workflow, path: impl AsRef<Path>) -> Result<()> {
    let yaml_content = serde_yaml::to_string(workflow)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Workflow saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Task;
    use tempfile::tempdir;

    #[test]
    fn test_parse_fills_default_names() {
        let yaml = r#"
id: wf
tasks:
  - id: fetch
    handler: noop
    conditions:
      - id: ready
        evaluator: "true"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert_eq!(workflow.name, "wf");
        assert_eq!(workflow.tasks[0].name, "fetch");
        assert_eq!(workflow.tasks[0].conditions[0].name, "ready");
    }

    #[test]
    fn test_parse_rejects_duplicate_tasks() {
        let yaml = r#"
id: wf
tasks:
  - id: a
    handler: noop
  - id: a
    handler: noop
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_save_workflow() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("test.yaml");

        let workflow = Workflow::from_tasks("wf", "Workflow", vec![Task::new("a", "noop")]);

        save_workflow(&workflow, &workflow_path).unwrap();
        assert!(workflow_path.exists());

        let loaded = load_workflow(&workflow_path).unwrap();
        assert_eq!(loaded, workflow);
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("bad.yaml");

        std::fs::write(&workflow_path, "this is not valid yaml: [[[").unwrap();

        let result = load_workflow(&workflow_path);
        assert!(matches!(result, Err(EngineError::Yaml(_))));
    }
}
