//! Monitoring Module
//!
//! Per-instance execution timeline used for run reports.

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
