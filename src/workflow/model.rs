//! Workflow Data Model
//!
//! Static workflow definitions: an ordered list of tasks, each with a
//! handler reference, configuration, required metadata fields and
//! pre-conditions.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: urn:flowrunner:ingest
//! name: Ingest
//! tasks:
//!   - id: fetch
//!     name: Fetch Files
//!     handler: shell
//!     config:
//!       command: curl -sO {SourceUrl}
//!     required_metadata:
//!       - SourceUrl
//!
//!   - id: catalog
//!     name: Catalog Files
//!     handler: shell
//!     config:
//!       command: ./catalog.sh
//!       QueueName: low
//!     conditions:
//!       - id: staged
//!         evaluator: metadata_present
//!         config:
//!           key: StagedFile
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Config key holding the resource-manager load estimate of a task.
pub const TASK_LOAD: &str = "TaskLoad";

/// Config key holding the resource-manager queue of a task.
pub const QUEUE_NAME: &str = "QueueName";

/// Key/value options attached to a task or condition.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct TaskConfig {
    properties: BTreeMap<String, String>,
}

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns the value of `key`, or `default` when unset.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// A pre-condition that must hold before its task may run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConditionDef {
    /// Identifier, unique within its task
    pub id: String,

    /// Human-readable name (defaults to the id)
    #[serde(default)]
    pub name: String,

    /// Registry identifier of the evaluator
    pub evaluator: String,

    #[serde(default, skip_serializing_if = "TaskConfig::is_empty")]
    pub config: TaskConfig,
}

impl ConditionDef {
    pub fn new(id: impl Into<String>, evaluator: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            name: id.clone(),
            id,
            evaluator: evaluator.into().trim().to_string(),
            config: TaskConfig::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.set(key, value);
        self
    }
}

/// A single task of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    /// Unique identifier within the workflow
    pub id: String,

    /// Human-readable name (defaults to the id)
    #[serde(default)]
    pub name: String,

    /// Registry identifier of the handler that performs the work
    pub handler: String,

    #[serde(default, skip_serializing_if = "TaskConfig::is_empty")]
    pub config: TaskConfig,

    /// Context keys that must be present before the task may start
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_metadata: Vec<String>,

    /// Pre-conditions, evaluated in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionDef>,
}

impl Task {
    /// Creates a new task.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::{ConditionDef, Task};
    ///
    /// let task = Task::new("catalog", "shell")
    ///     .with_config("command", "./catalog.sh {Filename}")
    ///     .requires("Filename")
    ///     .with_condition(ConditionDef::new("staged", "metadata_present").with_config("key", "Staged"));
    /// assert_eq!(task.conditions.len(), 1);
    /// ```
    pub fn new(id: impl Into<String>, handler: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            name: id.clone(),
            id,
            handler: handler.into().trim().to_string(),
            config: TaskConfig::new(),
            required_metadata: Vec::new(),
            conditions: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.set(key, value);
        self
    }

    /// Adds a required metadata field.
    pub fn requires(mut self, field: impl Into<String>) -> Self {
        self.required_metadata.push(field.into());
        self
    }

    pub fn with_condition(mut self, condition: ConditionDef) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Returns the first required field absent from `context`.
    pub fn missing_metadata<'a>(&'a self, context: &super::Metadata) -> Option<&'a str> {
        self.required_metadata
            .iter()
            .find(|field| !context.contains_key(field))
            .map(String::as_str)
    }
}

/// An ordered workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Tasks in execution order
    pub tasks: Vec<Task>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Creates a workflow from a list of tasks.
    pub fn from_tasks(id: impl Into<String>, name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks,
        }
    }

    /// Appends a task to the workflow.
    pub fn add_task(&mut self, task: Task) -> Result<(), String> {
        if self.tasks.iter().any(|t| t.id == task.id) {
            return Err(format!("Task '{}' already exists", task.id));
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Gets a task by ID.
    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Position of a task in execution order.
    pub fn task_index(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    /// Returns the task's name, falling back to its id.
    pub fn task_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.get_task(id).map(|t| t.name.as_str()).unwrap_or(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
