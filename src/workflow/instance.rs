//! Workflow Instances
//!
//! The mutable record of one execution of a [`Workflow`]: current task,
//! lifecycle status, shared metadata context and timestamps. Instances are
//! persisted through an [`InstanceRepository`](crate::repository::InstanceRepository)
//! after every state transition.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use super::model::Workflow;

/// Lifecycle status of a workflow instance.
///
/// ```text
/// Created -> Queued -> Started <-> Paused -> Finished
///                        |  \
///                        |   ResmgrSubmit (remote job outstanding)
///                        MetadataMissing (terminal)
/// ```
///
/// The prioritized scheduler additionally moves instances through
/// `WaitingOnResources` and may end them in `Failure`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    Created,
    Queued,
    WaitingOnResources,
    Started,
    #[serde(rename = "RESMGR_SUBMIT")]
    ResmgrSubmit,
    Paused,
    MetadataMissing,
    Failure,
    Finished,
}

/// Coarse grouping of statuses used by the schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Initial,
    Waiting,
    Running,
    Holding,
    Done,
}

impl WorkflowStatus {
    pub fn category(self) -> StatusCategory {
        match self {
            Self::Created => StatusCategory::Initial,
            Self::Queued | Self::WaitingOnResources => StatusCategory::Waiting,
            Self::Started | Self::ResmgrSubmit => StatusCategory::Running,
            Self::Paused => StatusCategory::Holding,
            Self::MetadataMissing | Self::Failure | Self::Finished => StatusCategory::Done,
        }
    }

    /// True once no driver will touch the instance again.
    pub fn is_terminal(self) -> bool {
        self.category() == StatusCategory::Done
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::WaitingOnResources => "WAITING_ON_RESOURCES",
            Self::Started => "STARTED",
            Self::ResmgrSubmit => "RESMGR_SUBMIT",
            Self::Paused => "PAUSED",
            Self::MetadataMissing => "METADATA_MISSING",
            Self::Failure => "FAILURE",
            Self::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Scheduling priority on a `0.0..=10.0` scale.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, PartialOrd)]
#[serde(transparent)]
pub struct Priority(f64);

impl Priority {
    pub const LOWEST: Priority = Priority(0.0);
    pub const LOW: Priority = Priority(2.5);
    pub const MEDIUM: Priority = Priority(5.0);
    pub const HIGH: Priority = Priority(7.5);
    pub const HIGHEST: Priority = Priority(10.0);

    /// Creates a priority, clamping into range.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::MEDIUM;
        }
        Priority(value.clamp(Self::LOWEST.0, Self::HIGHEST.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

/// One running (or finished) execution of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowInstance {
    /// Assigned by the repository on first persistence
    pub id: Option<String>,

    pub workflow: Workflow,

    pub current_task_id: String,

    pub status: WorkflowStatus,

    /// Diagnostic attached to failure states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    pub shared_context: Metadata,

    #[serde(default)]
    pub priority: Priority,

    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub current_task_start_time: Option<String>,
    pub current_task_end_time: Option<String>,

    /// Number of times pre-conditions held the instance back
    #[serde(default)]
    pub times_blocked: u32,

    pub created_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Builds a fresh instance positioned on the workflow's first task.
    pub fn new(workflow: Workflow, shared_context: Metadata) -> Self {
        let current_task_id = workflow
            .tasks
            .first()
            .map(|t| t.id.clone())
            .unwrap_or_default();

        Self {
            id: None,
            workflow,
            current_task_id,
            status: WorkflowStatus::Created,
            status_message: None,
            shared_context,
            priority: Priority::default(),
            start_time: None,
            end_time: None,
            current_task_start_time: None,
            current_task_end_time: None,
            times_blocked: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Id for log messages; `<unsaved>` before first persistence.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or("<unsaved>")
    }

    /// Minutes between workflow start and end (or now).
    pub fn wall_clock_minutes(&self) -> f64 {
        elapsed_minutes(
            self.start_time.as_deref(),
            self.end_time.as_deref(),
            self.label(),
        )
    }

    /// Minutes between current-task start and end (or now).
    pub fn current_task_wall_clock_minutes(&self) -> f64 {
        elapsed_minutes(
            self.current_task_start_time.as_deref(),
            self.current_task_end_time.as_deref(),
            self.label(),
        )
    }
}

/// Current UTC time as an ISO-8601 string.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a recorded timestamp. Blank and `"null"` values count as absent.
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() || value == "null" {
        return None;
    }

    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Elapsed minutes from `start` to `end` (or now).
///
/// Returns `0.0` when the start is missing or unparseable, and `0.0` with a
/// warning when the start lies after the stop time.
pub fn elapsed_minutes(start: Option<&str>, end: Option<&str>, label: &str) -> f64 {
    let Some(start) = start.and_then(parse_iso) else {
        return 0.0;
    };
    let stop = end.and_then(parse_iso).unwrap_or_else(Utc::now);

    if start > stop {
        warn!(
            "Start date time [{}] of workflow instance [{}] is AFTER stop date time [{}]",
            start.to_rfc3339(),
            label,
            stop.to_rfc3339()
        );
        return 0.0;
    }

    let micros = (stop - start).num_microseconds().unwrap_or(i64::MAX);
    micros as f64 / 1_000_000.0 / 60.0
}
