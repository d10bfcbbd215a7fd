//! Workflow Processor
//!
//! The driver of a single workflow instance. It walks the workflow's tasks
//! in order, checks required metadata and pre-conditions, dispatches each
//! task through an [`EngineRunner`] and persists every status transition.
//!
//! The same driver serves both scheduling strategies:
//!
//! - **Thread pool**: a worker thread calls [`WorkflowProcessor::run`], which
//!   loops until the tasks are exhausted or the instance is stopped.
//! - **Prioritized**: the task querier calls [`WorkflowProcessor::poll_runnable`]
//!   to find ready instances and the task runner calls
//!   [`WorkflowProcessor::dispatch`] once an execution slot is free.
//!
//! External callers may [`pause`](WorkflowProcessor::pause),
//! [`resume`](WorkflowProcessor::resume) and [`stop`](WorkflowProcessor::stop)
//! the instance at any time; the driver observes these requests at its
//! checkpoints. A local task already running is not interrupted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use sysinfo::System;

use super::condition::ConditionEvaluator;
use super::registry::HandlerRegistry;
use super::runner::{EngineRunner, Submission, TaskOutcome};
use super::{panic_message, sleep_while, CHECKPOINT_INTERVAL};
use crate::error::EngineError;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::repository::{self, InstanceRepository};
use crate::workflow::instance::iso_now;
use crate::workflow::metadata::keys;
use crate::workflow::{Metadata, Priority, Task, WorkflowInstance, WorkflowStatus};

/// Host name reported to tasks as the processing node.
static PROCESSING_NODE: Lazy<String> =
    Lazy::new(|| System::host_name().unwrap_or_else(|| "localhost".to_string()));

/// Per-driver settings taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Pause between pre-condition evaluations of a blocked task
    pub condition_wait: Duration,
    /// Engine address injected into task contexts
    pub engine_url: String,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            condition_wait: Duration::from_secs_f64(crate::config::DEFAULT_CONDITION_WAIT_SECS),
            engine_url: crate::config::DEFAULT_ENGINE_URL.to_string(),
        }
    }
}

/// How a pre-condition wait ended.
enum ConditionWait {
    Proceed,
    Stopped,
    Failed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WorkflowProcessor {
    instance: Mutex<WorkflowInstance>,
    repository: Arc<dyn InstanceRepository>,
    runner: Arc<dyn EngineRunner>,
    conditions: ConditionEvaluator,
    settings: ProcessorSettings,

    /// Position of the next task to run
    task_index: AtomicUsize,
    running: AtomicBool,
    paused: AtomicBool,
    /// Paused by unsatisfied pre-conditions rather than by a caller
    blocked: AtomicBool,
    /// Set when a caller resumes a blocked instance
    skip_conditions: AtomicBool,
    executing: AtomicBool,
    /// Set by `poll_runnable`, consumed by `dispatch`
    ready: AtomicBool,

    current_job: Mutex<Option<String>>,
    timeline: Mutex<ExecutionTimeline>,
    last_outcome: Mutex<Option<TaskOutcome>>,
}

impl WorkflowProcessor {
    /// Wraps an instance that has already been persisted.
    pub fn new(
        instance: WorkflowInstance,
        repository: Arc<dyn InstanceRepository>,
        runner: Arc<dyn EngineRunner>,
        registry: Arc<HandlerRegistry>,
        settings: ProcessorSettings,
    ) -> Self {
        let task_index = instance
            .workflow
            .task_index(&instance.current_task_id)
            .unwrap_or(0);

        Self {
            instance: Mutex::new(instance),
            repository,
            runner,
            conditions: ConditionEvaluator::new(registry),
            settings,
            task_index: AtomicUsize::new(task_index),
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            skip_conditions: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            current_job: Mutex::new(None),
            timeline: Mutex::new(ExecutionTimeline::new()),
            last_outcome: Mutex::new(None),
        }
    }

    fn instance(&self) -> MutexGuard<'_, WorkflowInstance> {
        lock(&self.instance)
    }

    /// Persists the instance. Failures are logged and never stop the driver.
    fn save(&self, inst: &mut WorkflowInstance) -> bool {
        match repository::persist(self.repository.as_ref(), inst) {
            Ok(()) => true,
            Err(e) => {
                error!("Exception persisting workflow instance [{}]: {}", inst.label(), e);
                false
            }
        }
    }

    /// Moves a non-terminal instance to `status` and persists it.
    fn transition(&self, status: WorkflowStatus) -> bool {
        let mut inst = self.instance();
        if inst.status.is_terminal() {
            debug!(
                "Workflow instance [{}] already {}; ignoring transition to {}",
                inst.label(),
                inst.status,
                status
            );
            return false;
        }

        debug!("Workflow instance [{}]: {} -> {}", inst.label(), inst.status, status);
        inst.status = status;
        self.save(&mut inst);
        true
    }

    pub fn instance_id(&self) -> Option<String> {
        self.instance().id.clone()
    }

    /// Snapshot of the instance.
    pub fn workflow_instance(&self) -> WorkflowInstance {
        self.instance().clone()
    }

    pub fn current_task_id(&self) -> String {
        self.instance().current_task_id.clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.instance().status
    }

    pub fn end_time(&self) -> Option<String> {
        self.instance().end_time.clone()
    }

    pub fn priority(&self) -> Priority {
        self.instance().priority
    }

    pub fn shared_context(&self) -> Metadata {
        self.instance().shared_context.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Paused by a caller, as opposed to waiting on pre-conditions.
    pub fn is_held(&self) -> bool {
        self.is_paused() && !self.blocked.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// True once the driver will make no further progress.
    pub fn is_done(&self) -> bool {
        self.is_stopped() || self.status().is_terminal()
    }

    pub fn last_outcome(&self) -> Option<TaskOutcome> {
        lock(&self.last_outcome).clone()
    }

    pub fn timeline(&self) -> ExecutionTimeline {
        lock(&self.timeline).clone()
    }

    /// Number of condition evaluators built so far.
    pub fn cached_conditions(&self) -> usize {
        self.conditions.cached_count()
    }

    pub fn pause(&self) {
        if self.is_stopped() {
            debug!("Ignoring pause of stopped workflow instance");
            return;
        }

        // An explicit pause takes over a pre-condition hold
        self.blocked.store(false, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
        if self.transition(WorkflowStatus::Paused) {
            info!("Pausing workflow instance [{}]", self.instance().label());
        }
    }

    pub fn resume(&self) {
        if self.is_stopped() || !self.paused.swap(false, Ordering::SeqCst) {
            debug!("Ignoring resume of workflow instance that is not paused");
            return;
        }

        if self.blocked.swap(false, Ordering::SeqCst) {
            self.skip_conditions.store(true, Ordering::SeqCst);
        }
        if self.transition(WorkflowStatus::Started) {
            info!("Resuming workflow instance [{}]", self.instance().label());
        }
    }

    /// Stops the driver and marks the instance finished. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Workflow instance already stopped");
            return;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.blocked.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);

        self.kill_current_job();

        let mut inst = self.instance();
        if !inst.status.is_terminal() {
            inst.status = WorkflowStatus::Finished;
            inst.end_time = Some(iso_now());
            self.save(&mut inst);
        }
        info!("Stopped workflow instance [{}]", inst.label());
    }

    /// Replaces the shared context and persists it.
    pub fn update_metadata(&self, metadata: Metadata) -> bool {
        let mut inst = self.instance();
        inst.shared_context = metadata;
        self.save(&mut inst)
    }

    /// Ends the instance with a `Failure` status.
    pub fn fail(&self, message: &str) {
        self.running.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.kill_current_job();

        let mut inst = self.instance();
        if inst.status.is_terminal() {
            return;
        }
        error!("Workflow instance [{}] failed: {}", inst.label(), message);
        inst.status = WorkflowStatus::Failure;
        inst.status_message = Some(message.to_string());
        inst.end_time = Some(iso_now());
        self.save(&mut inst);
    }

    fn kill_current_job(&self) {
        let job_id = lock(&self.current_job).take();
        if let Some(job_id) = job_id {
            info!("Killing outstanding job [{}]", job_id);
            if !self.runner.kill(&job_id) {
                warn!("Unable to kill job [{}]; it may still be running", job_id);
            }
        }
    }

    /// Marks the instance finished unless it already reached a terminal status.
    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.kill_current_job();

        let mut inst = self.instance();
        if inst.status.is_terminal() {
            return;
        }
        inst.status = WorkflowStatus::Finished;
        inst.end_time = Some(iso_now());
        self.save(&mut inst);
        info!(
            "Workflow instance [{}] of workflow [{}] finished",
            inst.label(),
            inst.workflow.name
        );
    }

    /// Drives the instance until its tasks are exhausted or it is stopped.
    pub fn run(&self) {
        {
            let mut inst = self.instance();
            if self.is_stopped() || inst.status.is_terminal() {
                return;
            }
            if inst.start_time.is_none() {
                inst.start_time = Some(iso_now());
            }
            if !self.is_paused() {
                inst.status = WorkflowStatus::Started;
            }
            self.save(&mut inst);
            info!("Running workflow instance [{}]", inst.label());
        }

        while !self.is_stopped() {
            if !self.wait_while_paused() {
                break;
            }

            let Some(task) = self.select_current_task(true) else {
                break;
            };

            if !self.check_required_metadata(&task) {
                break;
            }

            if !task.conditions.is_empty() {
                match self.await_conditions(&task) {
                    ConditionWait::Proceed => {}
                    ConditionWait::Stopped | ConditionWait::Failed => break,
                }
            }

            if !self.wait_while_paused() {
                break;
            }

            match self.begin_task(&task) {
                Ok(submission) => self.complete_task(&task, submission),
                Err(e) => {
                    error!("Unable to dispatch task [{}]: {}", task.name, e);
                    self.record_outcome(&task, TaskOutcome::Failed(e.to_string()));
                    self.task_index.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        self.finish();
    }

    /// Sleeps while paused. Returns false once stopped.
    fn wait_while_paused(&self) -> bool {
        if self.is_paused() && !self.is_stopped() {
            debug!("Workflow instance [{}] paused", self.instance().label());
            while self.is_paused() && !self.is_stopped() {
                thread::sleep(CHECKPOINT_INTERVAL);
            }
        }
        !self.is_stopped()
    }

    fn await_conditions(&self, task: &Task) -> ConditionWait {
        self.skip_conditions.store(false, Ordering::SeqCst);

        loop {
            let context = self.shared_context();
            match self.conditions.satisfied(&task.conditions, &task.id, &context) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    self.fail(&format!("task '{}': {}", task.id, e));
                    return ConditionWait::Failed;
                }
            }

            if !self.is_paused() {
                self.block_on_conditions(task);
            }
            debug!(
                "Pre-conditions for task [{}] not met; re-checking in {:?}",
                task.name, self.settings.condition_wait
            );

            sleep_while(self.settings.condition_wait, || {
                !self.is_stopped() && self.is_paused()
            });

            if self.is_stopped() {
                return ConditionWait::Stopped;
            }
            if !self.is_paused() {
                info!("Workflow instance resumed; proceeding with task [{}]", task.name);
                self.skip_conditions.store(false, Ordering::SeqCst);
                return ConditionWait::Proceed;
            }
        }

        if self.blocked.swap(false, Ordering::SeqCst) {
            self.paused.store(false, Ordering::SeqCst);
            self.transition(WorkflowStatus::Started);
        }
        ConditionWait::Proceed
    }

    fn block_on_conditions(&self, task: &Task) {
        self.blocked.store(true, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);

        let mut inst = self.instance();
        if inst.status.is_terminal() {
            return;
        }
        info!(
            "Pre-conditions for task [{}] of workflow instance [{}] not satisfied: pausing",
            task.name,
            inst.label()
        );
        inst.status = WorkflowStatus::Paused;
        inst.times_blocked += 1;
        self.save(&mut inst);
    }

    /// Points the instance at the task at `task_index`; `None` once exhausted.
    fn select_current_task(&self, always_persist: bool) -> Option<Task> {
        let index = self.task_index.load(Ordering::SeqCst);
        let mut inst = self.instance();
        let task = inst.workflow.tasks.get(index).cloned()?;

        let changed = inst.current_task_id != task.id;
        if changed {
            inst.current_task_id = task.id.clone();
        }
        if changed || always_persist {
            self.save(&mut inst);
        }
        Some(task)
    }

    /// Ends the instance with `MetadataMissing` when a required field is absent.
    fn check_required_metadata(&self, task: &Task) -> bool {
        let mut inst = self.instance();
        let Some(field) = task.missing_metadata(&inst.shared_context) else {
            return true;
        };

        error!(
            "Task [{}] of workflow instance [{}] requires metadata field [{}] which is not present",
            task.name,
            inst.label(),
            field
        );

        self.running.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        if !inst.status.is_terminal() {
            inst.status = WorkflowStatus::MetadataMissing;
            inst.status_message = Some(format!(
                "task '{}' requires missing metadata field '{}'",
                task.id, field
            ));
            inst.end_time = Some(iso_now());
            self.save(&mut inst);
        }
        false
    }

    fn inject_context(&self, inst: &mut WorkflowInstance, task: &Task) {
        let instance_id = inst.id.clone().unwrap_or_default();
        let workflow_id = inst.workflow.id.clone();
        let workflow_name = inst.workflow.name.clone();

        let context = &mut inst.shared_context;
        context.replace(keys::TASK_ID, task.id.as_str());
        context.replace(keys::WORKFLOW_INST_ID, instance_id.as_str());
        context.replace(keys::JOB_ID, instance_id);
        context.replace(keys::PROCESSING_NODE, PROCESSING_NODE.as_str());
        context.replace(keys::WORKFLOW_MANAGER_URL, self.settings.engine_url.as_str());
        context.replace(keys::WORKFLOW_ID, workflow_id);
        context.replace(keys::WORKFLOW_NAME, workflow_name);
    }

    /// Injects the standard context keys and submits the task.
    fn begin_task(&self, task: &Task) -> Result<Submission, EngineError> {
        let context = {
            let mut inst = self.instance();
            self.inject_context(&mut inst, task);
            if inst.start_time.is_none() {
                inst.start_time = Some(iso_now());
            }
            inst.shared_context.clone()
        };

        lock(&self.timeline).add_event(task.id.as_str(), EventType::Started);

        let submission = self.runner.submit(task, &context)?;

        let mut inst = self.instance();
        // A pause that raced the submission keeps its Paused status
        let keep_status = inst.status.is_terminal() || self.is_paused();
        match &submission {
            Submission::Local(_) => {
                if !keep_status {
                    inst.status = WorkflowStatus::Started;
                }
                inst.current_task_start_time = Some(iso_now());
                inst.current_task_end_time = None;
            }
            Submission::Remote(job_id) => {
                *lock(&self.current_job) = Some(job_id.clone());
                if !keep_status {
                    inst.status = WorkflowStatus::ResmgrSubmit;
                }
            }
        }
        self.save(&mut inst);

        Ok(submission)
    }

    /// Runs or polls a submitted task, then advances to the next task.
    fn complete_task(&self, task: &Task, submission: Submission) {
        let remote = matches!(submission, Submission::Remote(_));
        let mut context = self.shared_context();

        let outcome = self
            .runner
            .await_completion(submission, task, &mut context, &self.running);

        if remote {
            lock(&self.current_job).take();
            self.adopt_remote_updates();
        } else {
            let mut inst = self.instance();
            if outcome.is_success() {
                inst.shared_context = context;
            }
            inst.current_task_end_time = Some(iso_now());
            self.save(&mut inst);
        }

        self.record_outcome(task, outcome);
        self.task_index.fetch_add(1, Ordering::SeqCst);
    }

    /// Remote tasks update the stored instance themselves; pick up their changes.
    fn adopt_remote_updates(&self) {
        let Some(id) = self.instance_id() else {
            return;
        };

        match self.repository.get_workflow_instance_by_id(&id) {
            Ok(Some(stored)) => {
                let mut inst = self.instance();
                inst.shared_context = stored.shared_context;
                inst.current_task_start_time = stored.current_task_start_time;
                inst.current_task_end_time = stored.current_task_end_time;
            }
            Ok(None) => warn!("Workflow instance [{}] vanished from the repository", id),
            Err(e) => error!("Unable to refresh workflow instance [{}]: {}", id, e),
        }
    }

    fn record_outcome(&self, task: &Task, outcome: TaskOutcome) {
        let event = match &outcome {
            TaskOutcome::Completed => EventType::Completed,
            TaskOutcome::Failed(reason) => {
                warn!("Task [{}] failed ({}); continuing with next task", task.name, reason);
                EventType::Failed
            }
            TaskOutcome::Cancelled => EventType::Cancelled,
        };

        lock(&self.timeline).add_event(task.id.as_str(), event);
        *lock(&self.last_outcome) = Some(outcome);
    }

    /// Checks whether the current task can be dispatched now.
    ///
    /// Never blocks. As side effects the instance is finished when its tasks
    /// are exhausted, ended with `MetadataMissing` when required metadata is
    /// absent, and paused or un-paused according to its pre-conditions.
    pub fn poll_runnable(&self) -> bool {
        if self.is_stopped() || self.is_executing() || self.is_held() {
            return false;
        }

        let Some(task) = self.select_current_task(false) else {
            self.finish();
            return false;
        };

        if self.status().is_terminal() {
            self.running.store(false, Ordering::SeqCst);
            return false;
        }

        if !self.check_required_metadata(&task) {
            return false;
        }

        if !task.conditions.is_empty() && !self.skip_conditions.swap(false, Ordering::SeqCst) {
            let context = self.shared_context();
            match self.conditions.satisfied(&task.conditions, &task.id, &context) {
                Ok(true) => {}
                Ok(false) => {
                    if !self.blocked.load(Ordering::SeqCst) {
                        self.block_on_conditions(&task);
                    }
                    return false;
                }
                Err(e) => {
                    self.fail(&format!("task '{}': {}", task.id, e));
                    return false;
                }
            }
        }

        if self.blocked.swap(false, Ordering::SeqCst) {
            self.paused.store(false, Ordering::SeqCst);
            self.transition(WorkflowStatus::Started);
        }

        self.ready.store(true, Ordering::SeqCst);
        true
    }

    /// Records that the instance is runnable and waiting for a slot.
    pub fn mark_waiting_on_resources(&self) {
        let mut inst = self.instance();
        if inst.status.is_terminal() || inst.status == WorkflowStatus::WaitingOnResources {
            return;
        }
        debug!("Workflow instance [{}] waiting on resources", inst.label());
        inst.status = WorkflowStatus::WaitingOnResources;
        self.save(&mut inst);
    }

    /// Submits the current task and completes it on a background thread.
    ///
    /// Returns `Ok(false)` when the request is stale: the instance is paused,
    /// is no longer on `task_id`, is already executing, or has not been found
    /// runnable since its last dispatch. A submission error is returned to
    /// the caller.
    pub fn dispatch(self: &Arc<Self>, task_id: &str) -> Result<bool, EngineError> {
        if self.is_stopped() || self.is_paused() {
            return Ok(false);
        }
        if !self.ready.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        if self
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        let index = self.task_index.load(Ordering::SeqCst);
        let task = match self.instance().workflow.tasks.get(index) {
            Some(task) if task.id == task_id => task.clone(),
            _ => {
                debug!("Discarding stale dispatch of task [{}]", task_id);
                self.executing.store(false, Ordering::SeqCst);
                return Ok(false);
            }
        };

        let submission = match self.begin_task(&task) {
            Ok(submission) => submission,
            Err(e) => {
                self.record_outcome(&task, TaskOutcome::Failed(e.to_string()));
                self.executing.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let processor = Arc::clone(self);
        thread::Builder::new()
            .name(format!("task-{}", task.id))
            .spawn(move || {
                let completed =
                    panic::catch_unwind(AssertUnwindSafe(|| processor.complete_task(&task, submission)));
                if let Err(payload) = completed {
                    let message = panic_message(payload.as_ref());
                    processor.fail(&format!("task '{}' panicked: {}", task.id, message));
                }
                processor.executing.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.executing.store(false, Ordering::SeqCst);
                EngineError::Dispatch(format!("unable to spawn task thread: {}", e))
            })?;

        Ok(true)
    }
}
