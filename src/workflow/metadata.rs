//! Workflow Metadata
//!
//! The multi-valued key/value map shared by all tasks of a workflow
//! instance, plus the standard keys the engine injects before each task
//! is dispatched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Standard context keys set by the engine before dispatching a task.
pub mod keys {
    pub const TASK_ID: &str = "TaskId";
    pub const WORKFLOW_INST_ID: &str = "WorkflowInstId";
    pub const JOB_ID: &str = "JobId";
    pub const PROCESSING_NODE: &str = "ProcessingNode";
    pub const WORKFLOW_MANAGER_URL: &str = "WorkflowManagerUrl";
    pub const WORKFLOW_ID: &str = "WorkflowId";
    pub const WORKFLOW_NAME: &str = "WorkflowName";
}

/// A metadata context: every key maps to an ordered list of values.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value to `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    /// Sets `key` to exactly one value.
    pub fn replace(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), vec![value.into()]);
    }

    /// Sets `key` to the given values.
    pub fn replace_all(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.entries.insert(key.into(), values);
    }

    /// Returns the first value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Returns every value of `key`.
    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends all values of `other` onto this context.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, values) in &other.entries {
            self.entries
                .entry(key.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.add(key, value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_appends_values() {
        let mut met = Metadata::new();
        met.add("Filename", "a.dat");
        met.add("Filename", "b.dat");

        assert_eq!(met.get("Filename"), Some("a.dat"));
        assert_eq!(met.get_all("Filename").unwrap().len(), 2);
    }

    #[test]
    fn test_replace_overwrites() {
        let mut met = Metadata::new();
        met.add("TaskId", "one");
        met.add("TaskId", "two");
        met.replace("TaskId", "three");

        assert_eq!(met.get_all("TaskId").unwrap(), &["three".to_string()]);
    }

    #[test]
    fn test_contains_and_remove() {
        let mut met: Metadata = [("X", "1")].into_iter().collect();
        assert!(met.contains_key("X"));
        assert!(!met.contains_key("Y"));

        met.remove("X");
        assert!(met.is_empty());
    }

    #[test]
    fn test_merge() {
        let mut left: Metadata = [("A", "1")].into_iter().collect();
        let right: Metadata = [("A", "2"), ("B", "3")].into_iter().collect();
        left.merge(&right);

        assert_eq!(left.get_all("A").unwrap().len(), 2);
        assert_eq!(left.get("B"), Some("3"));
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let met: Metadata = [("A", "1")].into_iter().collect();
        let json = serde_json::to_string(&met).unwrap();
        assert_eq!(json, r#"{"A":["1"]}"#);
    }
}
