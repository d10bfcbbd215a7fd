//! Workflow Execution Engine
//!
//! Entry point for running workflows. The engine:
//! - validates workflow definitions against the handler registry
//! - creates and persists instances, one driver per instance
//! - schedules drivers on a worker pool or through the prioritized querier
//! - routes pause/resume/stop and metadata updates to tracked drivers
//! - retires finished drivers past `finished_retention`, leaving their
//!   records to the repository

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::panic_message;
use super::pool::WorkerPool;
use super::processor::{ProcessorSettings, WorkflowProcessor};
use super::querier::{HighestFifoPrioritySorter, PrioritySorter, ProcessorTable, TaskQuerier};
use super::registry::HandlerRegistry;
use super::resource::{ResourceManagerClient, ResourceRunner};
use super::runner::{EngineRunner, LocalRunner};
use super::task_runner::TaskRunner;
use crate::config::{EngineConfig, SchedulingStrategy};
use crate::error::{EngineError, Result};
use crate::repository::InstanceRepository;
use crate::workflow::validator::{describe, validate_workflow};
use crate::workflow::{Metadata, Priority, Workflow, WorkflowInstance, WorkflowStatus};

/// Interval at which [`Engine::wait_for_completion`] checks the instance.
const COMPLETION_CHECK_INTERVAL: Duration = Duration::from_millis(20);

enum Scheduler {
    ThreadPool(WorkerPool),
    Prioritized {
        querier: Arc<TaskQuerier>,
        task_runner: Arc<TaskRunner>,
        handles: Mutex<Vec<JoinHandle<()>>>,
    },
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::{load_workflow, Engine, EngineConfig, HandlerRegistry, Metadata};
/// use flowrunner::repository::MemoryInstanceRepository;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(
///         EngineConfig::from_env()?,
///         Arc::new(MemoryInstanceRepository::new()),
///         Arc::new(HandlerRegistry::with_builtins()),
///         None,
///     )?;
///
///     let workflow = load_workflow("pipeline.yaml")?;
///     let instance = engine.start_workflow(workflow, Metadata::new())?;
///     println!("started {}", instance.label());
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: EngineConfig,
    repository: Arc<dyn InstanceRepository>,
    registry: Arc<HandlerRegistry>,
    runner: Arc<dyn EngineRunner>,
    processors: ProcessorTable,
    scheduler: Scheduler,
    engine_url: RwLock<String>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Builds an engine and starts its scheduling threads.
    ///
    /// Tasks run through `resource_manager` when one is given, in-process
    /// otherwise.
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn InstanceRepository>,
        registry: Arc<HandlerRegistry>,
        resource_manager: Option<Arc<dyn ResourceManagerClient>>,
    ) -> Result<Self> {
        Self::with_sorter(
            config,
            repository,
            registry,
            resource_manager,
            Box::new(HighestFifoPrioritySorter::default()),
        )
    }

    /// Like [`Engine::new`], ordering prioritized work with `sorter`.
    pub fn with_sorter(
        config: EngineConfig,
        repository: Arc<dyn InstanceRepository>,
        registry: Arc<HandlerRegistry>,
        resource_manager: Option<Arc<dyn ResourceManagerClient>>,
        sorter: Box<dyn PrioritySorter>,
    ) -> Result<Self> {
        config.validate()?;

        let runner: Arc<dyn EngineRunner> = match resource_manager {
            Some(client) => {
                info!(
                    "Dispatching tasks to resource manager{}",
                    config
                        .resource_manager_url
                        .as_deref()
                        .map(|url| format!(" at {}", url))
                        .unwrap_or_default()
                );
                Arc::new(
                    ResourceRunner::new(client, config.polling_wait())
                        .with_defaults(config.default_queue_name.clone(), config.default_load),
                )
            }
            None => {
                if let Some(url) = &config.resource_manager_url {
                    warn!(
                        "Resource manager {} configured but no client supplied; running tasks locally",
                        url
                    );
                }
                info!("Running tasks locally ({} slots)", config.local_slots);
                Arc::new(LocalRunner::new(Arc::clone(&registry), config.local_slots))
            }
        };

        let processors: ProcessorTable = Arc::new(RwLock::new(HashMap::new()));

        let scheduler = match config.strategy {
            SchedulingStrategy::ThreadPool => Scheduler::ThreadPool(WorkerPool::new(config.pool_config())?),
            SchedulingStrategy::Prioritized => {
                let querier = Arc::new(TaskQuerier::new(
                    Arc::clone(&processors),
                    sorter,
                    config.querier_wait(),
                ));
                let task_runner = Arc::new(TaskRunner::new(Arc::clone(&querier), Arc::clone(&runner)));
                let handles = vec![querier.start()?, task_runner.start()?];

                Scheduler::Prioritized {
                    querier,
                    task_runner,
                    handles: Mutex::new(handles),
                }
            }
        };

        info!("Workflow engine started ({} strategy)", config.strategy);

        Ok(Self {
            engine_url: RwLock::new(config.engine_url.clone()),
            config,
            repository,
            registry,
            runner,
            processors,
            scheduler,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Starts an instance of `workflow` at the default priority.
    pub fn start_workflow(&self, workflow: Workflow, metadata: Metadata) -> Result<WorkflowInstance> {
        self.start_workflow_with_priority(workflow, metadata, Priority::default())
    }

    /// Validates the workflow, persists a new instance and schedules it.
    ///
    /// Returns the instance as it was when scheduled.
    pub fn start_workflow_with_priority(
        &self,
        workflow: Workflow,
        metadata: Metadata,
        priority: Priority,
    ) -> Result<WorkflowInstance> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Dispatch("engine is shut down".to_string()));
        }

        validate_workflow(&workflow, Some(&self.registry))
            .map_err(|errors| EngineError::Validation(describe(&errors)))?;

        let mut instance = WorkflowInstance::new(workflow, metadata).with_priority(priority);
        let id = self.repository.add_workflow_instance(&mut instance)?;

        instance.status = WorkflowStatus::Queued;
        self.repository.update_workflow_instance(&instance)?;

        self.retire_finished();

        let processor = Arc::new(WorkflowProcessor::new(
            instance,
            Arc::clone(&self.repository),
            Arc::clone(&self.runner),
            Arc::clone(&self.registry),
            self.processor_settings(),
        ));

        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&processor));

        let queued = processor.workflow_instance();
        info!(
            "Queued workflow instance [{}] of workflow [{}] (priority {})",
            id,
            queued.workflow.name,
            priority.value()
        );

        if let Scheduler::ThreadPool(pool) = &self.scheduler {
            let driver = Arc::clone(&processor);
            let job = move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| driver.run())) {
                    let message = panic_message(payload.as_ref());
                    driver.fail(&format!("workflow driver panicked: {}", message));
                }
            };
            if let Err(e) = pool.execute(job) {
                processor.fail(&format!("unable to schedule workflow instance: {}", e));
                return Err(e);
            }
        }

        Ok(queued)
    }

    fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            condition_wait: self.config.condition_wait(),
            engine_url: self
                .engine_url
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn processor(&self, id: &str) -> Option<Arc<WorkflowProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn tracked(&self, id: &str, action: &str) -> Option<Arc<WorkflowProcessor>> {
        let processor = self.processor(id);
        if processor.is_none() {
            warn!("Unable to {} workflow instance [{}]: not tracked by this engine", action, id);
        }
        processor
    }

    fn stored(&self, id: &str) -> Option<WorkflowInstance> {
        match self.repository.get_workflow_instance_by_id(id) {
            Ok(instance) => instance,
            Err(e) => {
                error!("Unable to load workflow instance [{}]: {}", id, e);
                None
            }
        }
    }

    pub fn stop_workflow(&self, id: &str) {
        if let Some(processor) = self.tracked(id, "stop") {
            processor.stop();
        }
    }

    pub fn pause_workflow_instance(&self, id: &str) {
        if let Some(processor) = self.tracked(id, "pause") {
            processor.pause();
        }
    }

    pub fn resume_workflow_instance(&self, id: &str) {
        if let Some(processor) = self.tracked(id, "resume") {
            processor.resume();
        }
    }

    /// Replaces the shared context of an instance and persists it.
    ///
    /// Falls back to the stored record when the instance is not tracked.
    /// Returns false when the instance is unknown or cannot be saved.
    pub fn update_metadata(&self, id: &str, metadata: Metadata) -> bool {
        if let Some(processor) = self.processor(id) {
            return processor.update_metadata(metadata);
        }

        let Some(mut instance) = self.stored(id) else {
            warn!("Unable to update metadata of unknown workflow instance [{}]", id);
            return false;
        };

        instance.shared_context = metadata;
        match self.repository.update_workflow_instance(&instance) {
            Ok(()) => true,
            Err(e) => {
                error!("Unable to update metadata of workflow instance [{}]: {}", id, e);
                false
            }
        }
    }

    /// Shared context of an instance; empty when unknown.
    pub fn workflow_instance_metadata(&self, id: &str) -> Metadata {
        self.workflow_instance(id)
            .map(|instance| instance.shared_context)
            .unwrap_or_default()
    }

    /// Current snapshot of an instance, tracked or stored.
    pub fn workflow_instance(&self, id: &str) -> Option<WorkflowInstance> {
        match self.processor(id) {
            Some(processor) => Some(processor.workflow_instance()),
            None => self.stored(id),
        }
    }

    pub fn wall_clock_minutes(&self, id: &str) -> f64 {
        self.workflow_instance(id)
            .map_or(0.0, |instance| instance.wall_clock_minutes())
    }

    pub fn current_task_wall_clock_minutes(&self, id: &str) -> f64 {
        self.workflow_instance(id)
            .map_or(0.0, |instance| instance.current_task_wall_clock_minutes())
    }

    /// Driver of a tracked instance.
    pub fn workflow_processor(&self, id: &str) -> Option<Arc<WorkflowProcessor>> {
        self.processor(id)
    }

    /// Drops the oldest finished drivers beyond `finished_retention`.
    ///
    /// Their instances stay readable through the repository. Called on every
    /// start; returns the number of drivers dropped.
    pub fn retire_finished(&self) -> usize {
        let mut processors = self.processors.write().unwrap_or_else(PoisonError::into_inner);

        // Terminal status is persisted under the same lock that sets it
        let mut finished: Vec<(String, Option<String>)> = processors
            .iter()
            .filter(|(_, p)| !p.is_executing() && p.status().is_terminal())
            .map(|(id, p)| (id.clone(), p.end_time()))
            .collect();
        if finished.len() <= self.config.finished_retention {
            return 0;
        }

        finished.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = finished.len() - self.config.finished_retention;
        for (id, _) in finished.iter().take(excess) {
            processors.remove(id);
            debug!("Retired finished workflow instance [{}]", id);
        }
        excess
    }

    /// Ids of the instances this engine is tracking.
    pub fn instance_ids(&self) -> Vec<String> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn instance_repository(&self) -> Arc<dyn InstanceRepository> {
        Arc::clone(&self.repository)
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine_url(&self) -> String {
        self.engine_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Address handed to instances started from now on.
    pub fn set_engine_url(&self, url: impl Into<String>) {
        *self.engine_url.write().unwrap_or_else(PoisonError::into_inner) = url.into();
    }

    /// Blocks until the instance reaches a terminal status or `timeout`
    /// passes. Returns the last snapshot seen.
    pub fn wait_for_completion(&self, id: &str, timeout: Duration) -> Option<WorkflowInstance> {
        let deadline = Instant::now() + timeout;
        loop {
            let instance = self.workflow_instance(id)?;
            let done = match self.processor(id) {
                Some(processor) => processor.is_done() && !processor.is_executing(),
                None => instance.status.is_terminal(),
            };
            if done || Instant::now() >= deadline {
                return Some(instance);
            }
            thread::sleep(COMPLETION_CHECK_INTERVAL);
        }
    }

    /// Stops every tracked driver and the scheduling threads. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down workflow engine");

        let processors: Vec<Arc<WorkflowProcessor>> = self
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for processor in processors {
            if !processor.is_done() {
                processor.stop();
            }
        }

        match &self.scheduler {
            Scheduler::ThreadPool(pool) => pool.shutdown(),
            Scheduler::Prioritized {
                querier,
                task_runner,
                handles,
            } => {
                querier.stop();
                task_runner.stop();
                let handles = std::mem::take(&mut *handles.lock().unwrap_or_else(PoisonError::into_inner));
                for handle in handles {
                    if handle.join().is_err() {
                        error!("Scheduling thread panicked");
                    }
                }
            }
        }

        self.runner.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::repository::MemoryInstanceRepository;
    use crate::workflow::Task;

    fn fast_config(strategy: SchedulingStrategy) -> EngineConfig {
        EngineConfig {
            strategy,
            min_pool_size: 1,
            max_pool_size: 4,
            condition_wait_secs: 0.02,
            polling_wait_secs: 0.02,
            querier_wait_secs: 0.02,
            local_slots: 4,
            ..Default::default()
        }
    }

    fn engine(strategy: SchedulingStrategy) -> Engine {
        Engine::new(
            fast_config(strategy),
            Arc::new(MemoryInstanceRepository::new()),
            Arc::new(HandlerRegistry::with_builtins()),
            None,
        )
        .unwrap()
    }

    fn noop_workflow() -> Workflow {
        Workflow::from_tasks("wf", "Noop", vec![Task::new("a", "noop"), Task::new("b", "noop")])
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig {
            min_pool_size: 5,
            max_pool_size: 1,
            ..Default::default()
        };
        let result = Engine::new(
            config,
            Arc::new(MemoryInstanceRepository::new()),
            Arc::new(HandlerRegistry::new()),
            None,
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_handler() {
        let engine = engine(SchedulingStrategy::ThreadPool);
        let workflow = Workflow::from_tasks("wf", "W", vec![Task::new("a", "missing")]);

        let result = engine.start_workflow(workflow, Metadata::new());
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(engine.instance_ids().is_empty());
    }

    #[test]
    fn test_start_persists_queued_instance() {
        let engine = engine(SchedulingStrategy::ThreadPool);
        let started = engine.start_workflow(noop_workflow(), Metadata::new()).unwrap();

        let id = started.id.clone().unwrap();
        assert_eq!(engine.instance_ids(), vec![id.clone()]);

        let done = engine.wait_for_completion(&id, Duration::from_secs(5)).unwrap();
        assert_eq!(done.status, WorkflowStatus::Finished);

        let stored = engine.instance_repository().get_workflow_instance_by_id(&id).unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Finished);
    }

    #[test]
    fn test_unknown_instance_is_noop() {
        let engine = engine(SchedulingStrategy::ThreadPool);
        engine.pause_workflow_instance("nope");
        engine.resume_workflow_instance("nope");
        engine.stop_workflow("nope");

        assert!(!engine.update_metadata("nope", Metadata::new()));
        assert!(engine.workflow_instance_metadata("nope").is_empty());
        assert_eq!(engine.wall_clock_minutes("nope"), 0.0);
        assert_eq!(engine.current_task_wall_clock_minutes("nope"), 0.0);
    }

    #[test]
    fn test_update_metadata_of_stored_instance() {
        let engine = engine(SchedulingStrategy::ThreadPool);
        let repository = engine.instance_repository();

        let mut instance = WorkflowInstance::new(noop_workflow(), Metadata::new());
        let id = repository.add_workflow_instance(&mut instance).unwrap();

        let mut metadata = Metadata::new();
        metadata.add("Owner", "ops");
        assert!(engine.update_metadata(&id, metadata));
        assert_eq!(engine.workflow_instance_metadata(&id).get("Owner"), Some("ops"));
    }

    #[test]
    fn test_engine_url_reaches_new_instances() {
        let engine = engine(SchedulingStrategy::ThreadPool);
        engine.set_engine_url("http://wm:9100");
        assert_eq!(engine.engine_url(), "http://wm:9100");

        let started = engine.start_workflow(noop_workflow(), Metadata::new()).unwrap();
        let id = started.id.unwrap();
        let done = engine.wait_for_completion(&id, Duration::from_secs(5)).unwrap();
        assert_eq!(
            done.shared_context.get(crate::workflow::metadata::keys::WORKFLOW_MANAGER_URL),
            Some("http://wm:9100")
        );
    }

    #[test]
    fn test_prioritized_strategy_runs_instances() {
        let engine = engine(SchedulingStrategy::Prioritized);
        let started = engine.start_workflow(noop_workflow(), Metadata::new()).unwrap();
        let id = started.id.unwrap();

        let done = engine.wait_for_completion(&id, Duration::from_secs(5)).unwrap();
        assert_eq!(done.status, WorkflowStatus::Finished);
    }

    #[test]
    fn test_shutdown_rejects_new_workflows() {
        let engine = engine(SchedulingStrategy::Prioritized);
        engine.shutdown();
        engine.shutdown();

        let result = engine.start_workflow(noop_workflow(), Metadata::new());
        assert!(matches!(result, Err(EngineError::Dispatch(_))));
    }

    #[test]
    fn test_retires_oldest_finished_drivers() {
        let config = EngineConfig {
            finished_retention: 1,
            ..fast_config(SchedulingStrategy::ThreadPool)
        };
        let engine = Engine::new(
            config,
            Arc::new(MemoryInstanceRepository::new()),
            Arc::new(HandlerRegistry::with_builtins()),
            None,
        )
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = engine.start_workflow(noop_workflow(), Metadata::new()).unwrap().id.unwrap();
            let done = engine.wait_for_completion(&id, Duration::from_secs(5)).unwrap();
            assert_eq!(done.status, WorkflowStatus::Finished);
            ids.push(id);
        }

        // The third start dropped the first driver
        assert!(engine.workflow_processor(&ids[0]).is_none());
        assert_eq!(engine.instance_ids().len(), 2);

        assert_eq!(engine.retire_finished(), 1);
        assert_eq!(engine.instance_ids(), vec![ids[2].clone()]);
        assert_eq!(engine.retire_finished(), 0);

        // Retired instances are still served from the repository
        let first = engine.wait_for_completion(&ids[0], Duration::from_secs(1)).unwrap();
        assert_eq!(first.status, WorkflowStatus::Finished);
        assert!(engine.wall_clock_minutes(&ids[1]) > 0.0);
    }

    #[test]
    fn test_panicking_driver_fails_instance_and_frees_worker() {
        let config = EngineConfig {
            min_pool_size: 1,
            max_pool_size: 1,
            ..fast_config(SchedulingStrategy::ThreadPool)
        };
        let engine = Engine::new(
            config,
            Arc::new(PanickingRepository::default()),
            Arc::new(HandlerRegistry::with_builtins()),
            None,
        )
        .unwrap();

        let bad = Workflow::from_tasks("wf", "Explodes", vec![Task::new("a", "noop")]);
        let bad_id = engine.start_workflow(bad, Metadata::new()).unwrap().id.unwrap();
        let done = engine.wait_for_completion(&bad_id, Duration::from_secs(5)).unwrap();
        assert_eq!(done.status, WorkflowStatus::Failure);
        assert!(done.status_message.unwrap().contains("driver panicked"));

        let good_id = engine.start_workflow(noop_workflow(), Metadata::new()).unwrap().id.unwrap();
        let done = engine.wait_for_completion(&good_id, Duration::from_secs(5)).unwrap();
        assert_eq!(done.status, WorkflowStatus::Finished);
    }

    /// Memory repository that panics when an "Explodes" instance starts running.
    #[derive(Default)]
    struct PanickingRepository {
        inner: MemoryInstanceRepository,
    }

    impl InstanceRepository for PanickingRepository {
        fn add_workflow_instance(&self, instance: &mut WorkflowInstance) -> std::result::Result<String, RepositoryError> {
            self.inner.add_workflow_instance(instance)
        }

        fn update_workflow_instance(&self, instance: &WorkflowInstance) -> std::result::Result<(), RepositoryError> {
            if instance.workflow.name == "Explodes" && instance.status == WorkflowStatus::Started {
                panic!("storage exploded");
            }
            self.inner.update_workflow_instance(instance)
        }

        fn get_workflow_instance_by_id(
            &self,
            id: &str,
        ) -> std::result::Result<Option<WorkflowInstance>, RepositoryError> {
            self.inner.get_workflow_instance_by_id(id)
        }

        fn get_workflow_instances(&self) -> std::result::Result<Vec<WorkflowInstance>, RepositoryError> {
            self.inner.get_workflow_instances()
        }
    }
}
