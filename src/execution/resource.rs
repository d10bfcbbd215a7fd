//! Resource Manager Dispatch
//!
//! Submits tasks as jobs to an external resource manager and polls them to
//! completion. The transport to the resource manager is not part of this
//! crate; callers provide a [`ResourceManagerClient`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::runner::{EngineRunner, Submission, TaskOutcome};
use super::sleep_while;
use crate::error::{EngineError, JobError};
use crate::workflow::model::{QUEUE_NAME, TASK_LOAD};
use crate::workflow::{Metadata, Task, TaskConfig};

/// Job class name the resource manager instantiates for workflow tasks.
pub const TASK_JOB_CLASS: &str = "org.apache.oodt.cas.workflow.structs.TaskJob";

/// Input class name paired with [`TASK_JOB_CLASS`].
pub const TASK_JOB_INPUT_CLASS: &str = "org.apache.oodt.cas.workflow.structs.TaskJobInput";

/// A unit of work submitted to the resource manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    /// Assigned by the resource manager
    pub id: Option<String>,
    /// Task id the job runs
    pub name: String,
    pub instance_class: String,
    pub input_class: String,
    pub load: u32,
    pub queue_name: String,
}

impl Job {
    /// Builds the job for a task, reading `TaskLoad` and `QueueName` from
    /// its config.
    pub fn for_task(task: &Task, default_queue: &str, default_load: u32) -> Self {
        let load = match task.config.get(TASK_LOAD) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(
                    "Task [{}] has unparseable {} '{}', using {}",
                    task.name, TASK_LOAD, raw, default_load
                );
                default_load
            }),
            None => default_load,
        };

        Self {
            id: None,
            name: task.id.clone(),
            instance_class: TASK_JOB_CLASS.to_string(),
            input_class: TASK_JOB_INPUT_CLASS.to_string(),
            load,
            queue_name: task.config.get_or(QUEUE_NAME, default_queue).to_string(),
        }
    }
}

/// Everything a remote worker needs to run the task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobInput {
    pub task_id: String,
    pub handler: String,
    pub config: TaskConfig,
    pub metadata: Metadata,
}

impl JobInput {
    pub fn new(task: &Task, metadata: &Metadata) -> Self {
        Self {
            task_id: task.id.clone(),
            handler: task.handler.clone(),
            config: task.config.clone(),
            metadata: metadata.clone(),
        }
    }
}

/// Client of an external resource manager.
pub trait ResourceManagerClient: Send + Sync {
    /// Submits a job and returns the id the resource manager assigned.
    fn submit_job(&self, job: &Job, input: &JobInput) -> Result<String, JobError>;

    fn is_job_complete(&self, job_id: &str) -> Result<bool, JobError>;

    fn kill_job(&self, job_id: &str) -> Result<bool, JobError>;
}

/// Dispatches tasks to a resource manager.
pub struct ResourceRunner {
    client: Arc<dyn ResourceManagerClient>,
    polling_wait: Duration,
    default_queue: String,
    default_load: u32,
}

impl ResourceRunner {
    pub fn new(client: Arc<dyn ResourceManagerClient>, polling_wait: Duration) -> Self {
        Self {
            client,
            polling_wait,
            default_queue: crate::config::DEFAULT_QUEUE_NAME.to_string(),
            default_load: crate::config::DEFAULT_LOAD,
        }
    }

    pub fn with_defaults(mut self, queue: impl Into<String>, load: u32) -> Self {
        self.default_queue = queue.into();
        self.default_load = load;
        self
    }
}

impl EngineRunner for ResourceRunner {
    fn submit(&self, task: &Task, context: &Metadata) -> Result<Submission, EngineError> {
        let job = Job::for_task(task, &self.default_queue, self.default_load);
        let input = JobInput::new(task, context);

        let job_id = self.client.submit_job(&job, &input)?;
        info!(
            "Submitted task [{}] as job [{}] to queue [{}] (load {})",
            task.name, job_id, job.queue_name, job.load
        );

        Ok(Submission::Remote(job_id))
    }

    fn await_completion(
        &self,
        submission: Submission,
        task: &Task,
        _context: &mut Metadata,
        running: &AtomicBool,
    ) -> TaskOutcome {
        let Submission::Remote(job_id) = submission else {
            return TaskOutcome::Failed("local submission passed to resource runner".to_string());
        };

        loop {
            if !running.load(Ordering::SeqCst) {
                info!("Stopped while waiting on job [{}] for task [{}]", job_id, task.name);
                return TaskOutcome::Cancelled;
            }

            match self.client.is_job_complete(&job_id) {
                Ok(true) => {
                    info!("Job [{}] for task [{}] complete", job_id, task.name);
                    return TaskOutcome::Completed;
                }
                Ok(false) => debug!("Job [{}] still running", job_id),
                Err(e) => warn!("Unable to check completion of job [{}]: {}", job_id, e),
            }

            sleep_while(self.polling_wait, || running.load(Ordering::SeqCst));
        }
    }

    fn has_open_slots(&self, _task: &Task) -> bool {
        true
    }

    fn kill(&self, job_id: &str) -> bool {
        match self.client.kill_job(job_id) {
            Ok(true) => {
                info!("Killed job [{}]", job_id);
                true
            }
            Ok(false) => {
                warn!("Attempt to kill job [{}] failed", job_id);
                false
            }
            Err(e) => {
                warn!("Attempt to kill job [{}] failed: {}", job_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubClient {
        polls_until_done: usize,
        polls: AtomicUsize,
        submitted: Mutex<Vec<Job>>,
    }

    impl ResourceManagerClient for StubClient {
        fn submit_job(&self, job: &Job, _input: &JobInput) -> Result<String, JobError> {
            self.submitted.lock().unwrap().push(job.clone());
            Ok("job-1".to_string())
        }

        fn is_job_complete(&self, _job_id: &str) -> Result<bool, JobError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n >= self.polls_until_done)
        }

        fn kill_job(&self, _job_id: &str) -> Result<bool, JobError> {
            Err(JobError::Transport("down".to_string()))
        }
    }

    #[test]
    fn test_job_defaults() {
        let job = Job::for_task(&Task::new("t", "shell"), "high", 2);
        assert_eq!(job.load, 2);
        assert_eq!(job.queue_name, "high");
        assert_eq!(job.instance_class, TASK_JOB_CLASS);
        assert_eq!(job.name, "t");
    }

    #[test]
    fn test_job_reads_task_config() {
        let task = Task::new("t", "shell")
            .with_config(TASK_LOAD, "5")
            .with_config(QUEUE_NAME, "low");
        let job = Job::for_task(&task, "high", 2);
        assert_eq!(job.load, 5);
        assert_eq!(job.queue_name, "low");

        let bad = Task::new("t", "shell").with_config(TASK_LOAD, "heavy");
        assert_eq!(Job::for_task(&bad, "high", 2).load, 2);
    }

    #[test]
    fn test_completes_on_first_poll_without_sleeping() {
        let client = Arc::new(StubClient {
            polls_until_done: 1,
            ..Default::default()
        });
        let runner = ResourceRunner::new(client.clone(), Duration::from_secs(30));
        let task = Task::new("t", "shell");
        let running = AtomicBool::new(true);

        let started = std::time::Instant::now();
        let submission = runner.submit(&task, &Metadata::new()).unwrap();
        let outcome = runner.await_completion(submission, &task, &mut Metadata::new(), &running);

        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(client.polls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_polls_until_complete() {
        let client = Arc::new(StubClient {
            polls_until_done: 3,
            ..Default::default()
        });
        let runner = ResourceRunner::new(client.clone(), Duration::from_millis(5));
        let task = Task::new("t", "shell");
        let running = AtomicBool::new(true);

        let submission = runner.submit(&task, &Metadata::new()).unwrap();
        let outcome = runner.await_completion(submission, &task, &mut Metadata::new(), &running);

        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(client.polls.load(Ordering::SeqCst), 3);
        assert_eq!(client.submitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stopped_driver_cancels() {
        let client = Arc::new(StubClient {
            polls_until_done: usize::MAX,
            ..Default::default()
        });
        let runner = ResourceRunner::new(client, Duration::from_millis(5));
        let task = Task::new("t", "shell");
        let running = AtomicBool::new(false);

        let outcome = runner.await_completion(
            Submission::Remote("job-1".to_string()),
            &task,
            &mut Metadata::new(),
            &running,
        );
        assert_eq!(outcome, TaskOutcome::Cancelled);
    }

    #[test]
    fn test_failed_kill_is_reported() {
        let runner = ResourceRunner::new(Arc::new(StubClient::default()), Duration::from_millis(5));
        assert!(!runner.kill("job-1"));
    }
}
