//! Execution Timeline
//!
//! Tracks task start/end times of a workflow instance for run reports.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Task dispatched
    Started,
    /// Task completed successfully
    Completed,
    /// Task failed; the instance moved on
    Failed,
    /// Task abandoned because the instance was stopped
    Cancelled,
}

impl EventType {
    fn is_end(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub task_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Ordered task events of one workflow instance.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Utc::now(),
        }
    }

    /// Records an event for a task.
    pub fn add_event(&mut self, task_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            task_id: task_id.into(),
            event_type,
            timestamp: Utc::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Number of events of the given type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn elapsed(&self) -> Duration {
        Utc::now() - self.start_time
    }

    /// Returns task durations, keyed by task id.
    ///
    /// Tasks that started but have not ended yet are left out.
    pub fn durations(&self) -> HashMap<String, Duration> {
        let mut starts: HashMap<&str, DateTime<Utc>> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            if event.event_type.is_end() {
                if let Some(start) = starts.get(event.task_id.as_str()) {
                    durations.insert(event.task_id.clone(), event.timestamp - *start);
                }
            } else {
                starts.insert(&event.task_id, event.timestamp);
            }
        }

        durations
    }

    /// Human-readable report, one line per finished task.
    pub fn summary(&self) -> String {
        let mut output = String::from("Execution Timeline:\n");
        let durations = self.durations();

        for event in self.events.iter().filter(|e| e.event_type.is_end()) {
            let millis = durations
                .get(&event.task_id)
                .map(|d| d.num_milliseconds())
                .unwrap_or(0);

            output.push_str(&format!(
                "  {:20} {:10} {:>8} ms\n",
                truncate(&event.task_id, 20),
                format!("{:?}", event.event_type),
                millis
            ));
        }

        output.push_str(&format!("Total: {} ms\n", self.elapsed().num_milliseconds()));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
