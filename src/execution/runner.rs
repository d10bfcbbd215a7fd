//! Engine Runners
//!
//! A runner performs the work of one task on behalf of a workflow driver,
//! either in-process ([`LocalRunner`]) or through a resource manager
//! ([`ResourceRunner`](super::resource::ResourceRunner)).
//!
//! Dispatch is split in two halves so the prioritized scheduler can react to
//! a failed submission synchronously while the task itself completes on a
//! background thread:
//!
//! 1. [`EngineRunner::submit`] claims capacity and hands back a [`Submission`]
//! 2. [`EngineRunner::await_completion`] runs or polls it to a [`TaskOutcome`]

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, info};

use super::panic_message;
use super::registry::{HandlerRegistry, TaskHandler};
use crate::error::EngineError;
use crate::workflow::{Metadata, Task};

/// Result of running one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The task failed; the workflow still advances to its next task
    Failed(String),
    /// The driver was stopped before the task finished
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A task accepted by a runner.
pub enum Submission {
    /// Handler to invoke on the caller's thread
    Local(Box<dyn TaskHandler>),
    /// Job id issued by the resource manager
    Remote(String),
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Remote(job_id) => write!(f, "Remote({})", job_id),
        }
    }
}

pub trait EngineRunner: Send + Sync {
    /// Accepts a task for execution.
    fn submit(&self, task: &Task, context: &Metadata) -> Result<Submission, EngineError>;

    /// Runs or polls a submission until it finishes or `running` is cleared.
    fn await_completion(
        &self,
        submission: Submission,
        task: &Task,
        context: &mut Metadata,
        running: &AtomicBool,
    ) -> TaskOutcome;

    /// True when another task may be dispatched now.
    fn has_open_slots(&self, task: &Task) -> bool;

    /// Cancels a remote job. Returns false when nothing was killed.
    fn kill(&self, _job_id: &str) -> bool {
        false
    }

    fn shutdown(&self) {}
}

/// Runs task handlers synchronously on the driver's thread.
pub struct LocalRunner {
    registry: Arc<HandlerRegistry>,
    slots: usize,
    in_flight: AtomicUsize,
}

impl LocalRunner {
    pub fn new(registry: Arc<HandlerRegistry>, slots: usize) -> Self {
        Self {
            registry,
            slots: slots.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl EngineRunner for LocalRunner {
    fn submit(&self, task: &Task, _context: &Metadata) -> Result<Submission, EngineError> {
        let handler = self.registry.create_handler(&task.handler)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Submission::Local(handler))
    }

    fn await_completion(
        &self,
        submission: Submission,
        task: &Task,
        context: &mut Metadata,
        _running: &AtomicBool,
    ) -> TaskOutcome {
        let Submission::Local(mut handler) = submission else {
            error!("Local runner received a remote submission for task '{}'", task.id);
            return TaskOutcome::Failed("remote submission passed to local runner".to_string());
        };

        info!("Executing task: [{}]", task.name);

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.run(context, &task.config)));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(())) => {
                info!("Task [{}] completed", task.name);
                TaskOutcome::Completed
            }
            Ok(Err(e)) => {
                error!("Task [{}] failed: {}", task.name, e);
                TaskOutcome::Failed(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Task [{}] panicked: {}", task.name, message);
                TaskOutcome::Failed(format!("handler panicked: {}", message))
            }
        }
    }

    fn has_open_slots(&self, _task: &Task) -> bool {
        self.in_flight() < self.slots
    }

    fn shutdown(&self) {
        debug!("Local runner shut down ({} tasks in flight)", self.in_flight());
    }
}
