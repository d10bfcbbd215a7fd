//! Task Querier
//!
//! Background scan over the engine's tracked drivers. Each pass collects
//! the instances whose current task is ready to run, orders them with a
//! [`PrioritySorter`] and publishes the list for the task runner.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use super::processor::WorkflowProcessor;
use super::{panic_message, sleep_while};
use crate::workflow::{Priority, Task};

/// Drivers tracked by the engine, keyed by instance id.
pub type ProcessorTable = Arc<RwLock<HashMap<String, Arc<WorkflowProcessor>>>>;

/// An instance whose current task may be dispatched.
#[derive(Clone)]
pub struct RunnableTask {
    pub processor: Arc<WorkflowProcessor>,
    pub instance_id: String,
    pub task: Task,
    pub priority: Priority,
    /// Creation time of the instance
    pub created_at: DateTime<Utc>,
}

impl RunnableTask {
    /// Captures the driver's current task.
    pub fn from_processor(processor: Arc<WorkflowProcessor>) -> Option<Self> {
        let inst = processor.workflow_instance();
        let task = inst.workflow.get_task(&inst.current_task_id)?.clone();

        Some(Self {
            instance_id: inst.id.clone().unwrap_or_default(),
            task,
            priority: inst.priority,
            created_at: inst.created_at,
            processor,
        })
    }
}

impl std::fmt::Debug for RunnableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableTask")
            .field("instance_id", &self.instance_id)
            .field("task", &self.task.id)
            .field("priority", &self.priority.value())
            .finish()
    }
}

/// Orders runnable tasks, most urgent first.
pub trait PrioritySorter: Send + Sync {
    fn sort(&self, tasks: &mut [RunnableTask]);
}

/// Highest priority first; ties go to the oldest instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighestPrioritySorter;

impl PrioritySorter for HighestPrioritySorter {
    fn sort(&self, tasks: &mut [RunnableTask]) {
        tasks.sort_by(|a, b| {
            b.priority
                .value()
                .total_cmp(&a.priority.value())
                .then(a.created_at.cmp(&b.created_at))
        });
    }
}

/// Highest priority first, where priority grows the longer an instance
/// has been waiting.
///
/// Every `seconds_between_boosts` seconds of age adds `boost_amount` to the
/// base priority, up to `boost_cap` in total. Ties go to the oldest instance.
#[derive(Debug, Clone, Copy)]
pub struct HighestFifoPrioritySorter {
    pub seconds_between_boosts: u64,
    pub boost_amount: f64,
    pub boost_cap: f64,
}

impl Default for HighestFifoPrioritySorter {
    fn default() -> Self {
        Self {
            seconds_between_boosts: 60,
            boost_amount: 0.5,
            boost_cap: 2.0,
        }
    }
}

impl HighestFifoPrioritySorter {
    /// Priority of a task after age boosting, as of `now`.
    pub fn effective_priority(&self, task: &RunnableTask, now: DateTime<Utc>) -> f64 {
        let waited = (now - task.created_at).num_seconds().max(0) as u64;
        let boosts = waited.checked_div(self.seconds_between_boosts).unwrap_or(0);
        let boost = (boosts as f64 * self.boost_amount).min(self.boost_cap);
        task.priority.value() + boost
    }
}

impl PrioritySorter for HighestFifoPrioritySorter {
    fn sort(&self, tasks: &mut [RunnableTask]) {
        let now = Utc::now();
        tasks.sort_by(|a, b| {
            self.effective_priority(b, now)
                .total_cmp(&self.effective_priority(a, now))
                .then(a.created_at.cmp(&b.created_at))
        });
    }
}

pub struct TaskQuerier {
    processors: ProcessorTable,
    queue: Mutex<VecDeque<RunnableTask>>,
    sorter: Box<dyn PrioritySorter>,
    wait: Duration,
    running: AtomicBool,
}

impl TaskQuerier {
    pub fn new(processors: ProcessorTable, sorter: Box<dyn PrioritySorter>, wait: Duration) -> Self {
        Self {
            processors,
            queue: Mutex::new(VecDeque::new()),
            sorter,
            wait,
            running: AtomicBool::new(true),
        }
    }

    /// Runs one pass over the tracked drivers and publishes the result.
    ///
    /// A driver that panics while being polled is failed and skipped.
    /// Returns the number of runnable tasks found.
    pub fn scan_once(&self) -> usize {
        let processors: Vec<Arc<WorkflowProcessor>> = self
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut runnable = Vec::new();
        for processor in processors {
            if processor.is_done() || processor.is_held() || processor.is_executing() {
                continue;
            }

            let polled = panic::catch_unwind(AssertUnwindSafe(|| {
                let runnable = processor.poll_runnable();
                if runnable {
                    processor.mark_waiting_on_resources();
                }
                runnable
            }));
            match polled {
                Ok(true) => {}
                Ok(false) => continue,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Polling workflow instance panicked: {}", message);
                    processor.fail(&format!("driver panicked while polling: {}", message));
                    continue;
                }
            }

            if let Some(task) = RunnableTask::from_processor(processor) {
                runnable.push(task);
            }
        }

        if runnable.len() > 1 {
            self.sorter.sort(&mut runnable);
        }

        let count = runnable.len();
        *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = runnable.into();

        if count > 0 {
            debug!("Task querier found {} runnable tasks", count);
        }
        count
    }

    /// Takes the most urgent runnable task.
    pub fn get_next(&self) -> Option<RunnableTask> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Scans every `wait` until stopped.
    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let querier = Arc::clone(self);
        thread::Builder::new()
            .name("task-querier".to_string())
            .spawn(move || {
                info!("Task querier started (every {:?})", querier.wait);
                while querier.is_running() {
                    let pass = panic::catch_unwind(AssertUnwindSafe(|| querier.scan_once()));
                    if let Err(payload) = pass {
                        error!("Task querier pass panicked: {}", panic_message(payload.as_ref()));
                    }
                    sleep_while(querier.wait, || querier.is_running());
                }
                info!("Task querier stopped");
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
    use crate::execution::processor::ProcessorSettings;
    use crate::execution::registry::HandlerRegistry;
    use crate::execution::runner::LocalRunner;
    use crate::repository::{InstanceRepository, MemoryInstanceRepository};
    use crate::workflow::{ConditionDef, Metadata, Workflow, WorkflowInstance, WorkflowStatus};

    fn table_with(instances: Vec<WorkflowInstance>) -> (ProcessorTable, Vec<Arc<WorkflowProcessor>>) {
        table_with_registry(instances, HandlerRegistry::with_builtins())
    }

    fn table_with_registry(
        instances: Vec<WorkflowInstance>,
        registry: HandlerRegistry,
    ) -> (ProcessorTable, Vec<Arc<WorkflowProcessor>>) {
        let repository = Arc::new(MemoryInstanceRepository::new());
        let registry = Arc::new(registry);
        let runner = Arc::new(LocalRunner::new(Arc::clone(&registry), 4));
        let table: ProcessorTable = Arc::new(RwLock::new(HashMap::new()));

        let mut processors = Vec::new();
        for mut inst in instances {
            let id = repository.add_workflow_instance(&mut inst).unwrap();
            let processor = Arc::new(WorkflowProcessor::new(
                inst,
                repository.clone(),
                runner.clone(),
                Arc::clone(&registry),
                ProcessorSettings::default(),
            ));
            table.write().unwrap().insert(id, Arc::clone(&processor));
            processors.push(processor);
        }
        (table, processors)
    }

    fn instance(priority: f64) -> WorkflowInstance {
        let workflow = Workflow::from_tasks("wf", "W", vec![Task::new("a", "noop")]);
        WorkflowInstance::new(workflow, Metadata::new()).with_priority(Priority::new(priority))
    }

    #[test]
    fn test_orders_by_priority() {
        let (table, _) = table_with(vec![instance(2.0), instance(9.0), instance(5.0)]);
        let querier = TaskQuerier::new(table, Box::new(HighestPrioritySorter), Duration::from_millis(10));

        assert_eq!(querier.scan_once(), 3);

        let order: Vec<f64> = std::iter::from_fn(|| querier.get_next())
            .map(|t| t.priority.value())
            .collect();
        assert_eq!(order, vec![9.0, 5.0, 2.0]);
        assert!(querier.get_next().is_none());
    }

    #[test]
    fn test_marks_waiting_on_resources() {
        let (table, processors) = table_with(vec![instance(5.0)]);
        let querier = TaskQuerier::new(table, Box::new(HighestPrioritySorter), Duration::from_millis(10));

        querier.scan_once();
        assert_eq!(processors[0].status(), WorkflowStatus::WaitingOnResources);
    }

    #[test]
    fn test_skips_held_and_blocked() {
        let blocked = {
            let task = Task::new("a", "noop").with_condition(ConditionDef::new("c", "false"));
            WorkflowInstance::new(Workflow::from_tasks("wf", "W", vec![task]), Metadata::new())
        };
        let (table, processors) = table_with(vec![instance(5.0), instance(5.0), blocked]);
        processors[0].pause();

        let querier = TaskQuerier::new(table, Box::new(HighestPrioritySorter), Duration::from_millis(10));
        assert_eq!(querier.scan_once(), 1);

        let next = querier.get_next().unwrap();
        assert!(Arc::ptr_eq(&next.processor, &processors[1]));
        assert_eq!(processors[2].status(), WorkflowStatus::Paused);
    }

    #[test]
    fn test_rescan_replaces_list() {
        let (table, processors) = table_with(vec![instance(5.0)]);
        let querier = TaskQuerier::new(table, Box::new(HighestPrioritySorter), Duration::from_millis(10));

        querier.scan_once();
        processors[0].stop();
        querier.scan_once();

        assert_eq!(querier.queued(), 0);
    }

    #[test]
    fn test_fifo_sorter_boosts_waiting_instances() {
        let (_, processors) = table_with(vec![instance(5.0), instance(6.0)]);
        let mut old = RunnableTask::from_processor(Arc::clone(&processors[0])).unwrap();
        let young = RunnableTask::from_processor(Arc::clone(&processors[1])).unwrap();
        old.created_at = Utc::now() - chrono::Duration::minutes(10);

        let sorter = HighestFifoPrioritySorter::default();
        assert_eq!(sorter.effective_priority(&old, Utc::now()), 7.0);

        let mut tasks = vec![young, old];
        sorter.sort(&mut tasks);
        assert_eq!(tasks[0].priority.value(), 5.0);

        HighestPrioritySorter.sort(&mut tasks);
        assert_eq!(tasks[0].priority.value(), 6.0);
    }

    #[test]
    fn test_background_loop_stops() {
        let (table, processors) = table_with(vec![instance(5.0)]);
        let querier = Arc::new(TaskQuerier::new(
            table,
            Box::new(HighestPrioritySorter),
            Duration::from_millis(10),
        ));

        let handle = querier.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while processors[0].status() != WorkflowStatus::WaitingOnResources
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        querier.stop();
        handle.join().unwrap();

        assert_eq!(processors[0].status(), WorkflowStatus::WaitingOnResources);
    }

    #[test]
    fn test_panicking_condition_fails_only_its_instance() {
        let mut registry = HandlerRegistry::with_builtins();
        registry.register_condition_fn("boom", |_, _| panic!("evaluator exploded"));
        let bad = {
            let task = Task::new("a", "noop").with_condition(ConditionDef::new("c", "boom"));
            WorkflowInstance::new(Workflow::from_tasks("wf", "W", vec![task]), Metadata::new())
        };
        let (table, processors) = table_with_registry(vec![bad, instance(5.0)], registry);
        let querier = TaskQuerier::new(table, Box::new(HighestPrioritySorter), Duration::from_millis(10));

        assert_eq!(querier.scan_once(), 1);

        let failed = processors[0].workflow_instance();
        assert_eq!(failed.status, WorkflowStatus::Failure);
        assert!(failed.status_message.unwrap_or_default().contains("evaluator exploded"));
        assert!(Arc::ptr_eq(&querier.get_next().unwrap().processor, &processors[1]));

        // Failed drivers are skipped from then on
        assert_eq!(querier.scan_once(), 1);
    }

    /// Panics on its first call only.
    struct FlakySorter {
        tripped: AtomicBool,
    }

    impl PrioritySorter for FlakySorter {
        fn sort(&self, tasks: &mut [RunnableTask]) {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("sorter exploded");
            }
            HighestPrioritySorter.sort(tasks);
        }
    }

    #[test]
    fn test_background_loop_survives_panicking_pass() {
        let (table, _) = table_with(vec![instance(5.0), instance(7.0)]);
        let querier = Arc::new(TaskQuerier::new(
            table,
            Box::new(FlakySorter {
                tripped: AtomicBool::new(false),
            }),
            Duration::from_millis(10),
        ));

        let handle = querier.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while querier.queued() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        querier.stop();
        handle.join().unwrap();

        assert_eq!(querier.queued(), 2);
        assert_eq!(querier.get_next().unwrap().priority.value(), 7.0);
    }
}
