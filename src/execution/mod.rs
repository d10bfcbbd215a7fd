//! Workflow Execution Module
//!
//! Drives workflow instances through their tasks.
//!
//! # Architecture
//!
//! - [`engine`]: Entry point tracking drivers and choosing a strategy
//! - [`processor`]: Per-instance driver
//! - [`runner`] / [`resource`]: In-process and resource-manager task dispatch
//! - [`pool`]: Bounded worker pool (thread-per-instance strategy)
//! - [`querier`] / [`task_runner`]: Prioritized strategy loops
//! - [`registry`] / [`builtin`] / [`condition`]: Task logic and pre-conditions

pub mod builtin;
pub mod condition;
pub mod engine;
pub mod pool;
pub mod processor;
pub mod querier;
pub mod registry;
pub mod resource;
pub mod runner;
pub mod task_runner;

pub use condition::ConditionEvaluator;
pub use engine::Engine;
pub use pool::WorkerPool;
pub use processor::WorkflowProcessor;
pub use querier::{
    HighestFifoPrioritySorter, HighestPrioritySorter, PrioritySorter, RunnableTask, TaskQuerier,
};
pub use registry::{Condition, HandlerRegistry, TaskHandler};
pub use resource::{Job, JobInput, ResourceManagerClient, ResourceRunner};
pub use runner::{EngineRunner, LocalRunner, Submission, TaskOutcome};
pub use task_runner::TaskRunner;

use std::thread;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep inside a wait loop.
pub(crate) const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(50);

/// Sleeps for up to `duration` in short slices, returning early once
/// `keep_waiting` turns false. Returns true if the full duration elapsed.
pub(crate) fn sleep_while(duration: Duration, mut keep_waiting: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + duration;

    loop {
        if !keep_waiting() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CHECKPOINT_INTERVAL.min(deadline - now));
    }
}

/// Text carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
