//! Task Runner
//!
//! Background loop that takes runnable tasks from the [`TaskQuerier`] and
//! dispatches them once the engine runner reports a free slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use super::querier::{RunnableTask, TaskQuerier};
use super::runner::EngineRunner;

/// Pause between attempts while there is nothing to dispatch.
pub const IDLE_WAIT: Duration = Duration::from_millis(50);

pub struct TaskRunner {
    querier: Arc<TaskQuerier>,
    runner: Arc<dyn EngineRunner>,
    idle_wait: Duration,
    running: AtomicBool,
}

impl TaskRunner {
    pub fn new(querier: Arc<TaskQuerier>, runner: Arc<dyn EngineRunner>) -> Self {
        Self {
            querier,
            runner,
            idle_wait: IDLE_WAIT,
            running: AtomicBool::new(true),
        }
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Makes one dispatch attempt.
    ///
    /// `pending` holds the task taken from the querier while it waits for a
    /// slot. Returns true when a task was handed to its driver.
    pub fn run_once(&self, pending: &mut Option<RunnableTask>) -> bool {
        if pending.is_none() {
            *pending = self.querier.get_next();
        }

        let Some(next) = pending.take() else {
            return false;
        };

        if !self.runner.has_open_slots(&next.task) {
            debug!("No open slots for task [{}]; holding it", next.task.name);
            *pending = Some(next);
            return false;
        }

        self.dispatch(next)
    }

    fn dispatch(&self, next: RunnableTask) -> bool {
        match next.processor.dispatch(&next.task.id) {
            Ok(true) => {
                info!(
                    "Dispatched task [{}] of workflow instance [{}]",
                    next.task.name, next.instance_id
                );
                true
            }
            Ok(false) => {
                debug!(
                    "Skipped stale task [{}] of workflow instance [{}]",
                    next.task.name, next.instance_id
                );
                false
            }
            Err(e) => {
                error!(
                    "Failed to dispatch task [{}] of workflow instance [{}]: {}",
                    next.task.name, next.instance_id, e
                );
                next.processor
                    .fail(&format!("failed to dispatch task '{}': {}", next.task.id, e));
                false
            }
        }
    }

    /// Dispatches until stopped.
    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let runner = Arc::clone(self);
        thread::Builder::new()
            .name("task-runner".to_string())
            .spawn(move || {
                info!("Task runner started");
                let mut pending = None;
                while runner.is_running() {
                    if !runner.run_once(&mut pending) {
                        thread::sleep(runner.idle_wait);
                    }
                }
                info!("Task runner stopped");
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::execution::processor::{ProcessorSettings, WorkflowProcessor};
    use crate::execution::querier::{HighestPrioritySorter, ProcessorTable};
    use crate::execution::registry::HandlerRegistry;
    use crate::execution::runner::{LocalRunner, Submission, TaskOutcome};
    use crate::repository::{InstanceRepository, MemoryInstanceRepository};
    use crate::workflow::{Metadata, Task, Workflow, WorkflowInstance, WorkflowStatus};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::RwLock;

    /// Refuses every submission.
    struct RefusingRunner;

    impl EngineRunner for RefusingRunner {
        fn submit(&self, _task: &Task, _context: &Metadata) -> Result<Submission, EngineError> {
            Err(EngineError::Dispatch("queue offline".to_string()))
        }

        fn await_completion(
            &self,
            _submission: Submission,
            _task: &Task,
            _context: &mut Metadata,
            _running: &AtomicBool,
        ) -> TaskOutcome {
            TaskOutcome::Completed
        }

        fn has_open_slots(&self, _task: &Task) -> bool {
            true
        }
    }

    /// Never has capacity.
    struct FullRunner;

    impl EngineRunner for FullRunner {
        fn submit(&self, _task: &Task, _context: &Metadata) -> Result<Submission, EngineError> {
            Err(EngineError::Dispatch("full".to_string()))
        }

        fn await_completion(
            &self,
            _submission: Submission,
            _task: &Task,
            _context: &mut Metadata,
            _running: &AtomicBool,
        ) -> TaskOutcome {
            TaskOutcome::Completed
        }

        fn has_open_slots(&self, _task: &Task) -> bool {
            false
        }
    }

    fn setup(runner: Arc<dyn EngineRunner>) -> (Arc<TaskQuerier>, Arc<WorkflowProcessor>) {
        let repository = Arc::new(MemoryInstanceRepository::new());
        let registry = Arc::new(HandlerRegistry::with_builtins());
        let workflow = Workflow::from_tasks("wf", "W", vec![Task::new("a", "noop")]);

        let mut inst = WorkflowInstance::new(workflow, Metadata::new());
        let id = repository.add_workflow_instance(&mut inst).unwrap();
        let processor = Arc::new(WorkflowProcessor::new(
            inst,
            repository,
            runner,
            registry,
            ProcessorSettings::default(),
        ));

        let table: ProcessorTable = Arc::new(RwLock::new(HashMap::new()));
        table.write().unwrap().insert(id, Arc::clone(&processor));
        let querier = Arc::new(TaskQuerier::new(
            table,
            Box::new(HighestPrioritySorter),
            Duration::from_millis(10),
        ));
        (querier, processor)
    }

    #[test]
    fn test_dispatch_failure_forces_failure_status() {
        let runner: Arc<dyn EngineRunner> = Arc::new(RefusingRunner);
        let (querier, processor) = setup(Arc::clone(&runner));
        let task_runner = TaskRunner::new(Arc::clone(&querier), runner);

        querier.scan_once();
        let mut pending = None;
        assert!(!task_runner.run_once(&mut pending));

        let inst = processor.workflow_instance();
        assert_eq!(inst.status, WorkflowStatus::Failure);
        assert!(inst.status_message.unwrap().contains("queue offline"));

        // No retry
        querier.scan_once();
        assert_eq!(querier.queued(), 0);
    }

    #[test]
    fn test_holds_task_without_slots() {
        let runner: Arc<dyn EngineRunner> = Arc::new(FullRunner);
        let (querier, processor) = setup(Arc::clone(&runner));
        let task_runner = TaskRunner::new(Arc::clone(&querier), runner);

        querier.scan_once();
        let mut pending = None;
        assert!(!task_runner.run_once(&mut pending));
        assert!(pending.is_some());
        assert_eq!(processor.status(), WorkflowStatus::WaitingOnResources);
    }

    #[test]
    fn test_dispatches_local_task() {
        let registry = Arc::new(HandlerRegistry::with_builtins());
        let runner: Arc<dyn EngineRunner> = Arc::new(LocalRunner::new(registry, 2));
        let (querier, processor) = setup(Arc::clone(&runner));
        let task_runner = TaskRunner::new(Arc::clone(&querier), runner);

        querier.scan_once();
        let mut pending = None;
        assert!(task_runner.run_once(&mut pending));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while processor.is_executing() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        querier.scan_once();
        assert_eq!(processor.status(), WorkflowStatus::Finished);
    }

    #[test]
    fn test_loop_stops() {
        let runner: Arc<dyn EngineRunner> = Arc::new(FullRunner);
        let (querier, _) = setup(Arc::clone(&runner));
        let task_runner = Arc::new(TaskRunner::new(querier, runner).with_idle_wait(Duration::from_millis(5)));

        let handle = task_runner.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        task_runner.stop();
        handle.join().unwrap();
        assert!(!task_runner.is_running());
    }
}
