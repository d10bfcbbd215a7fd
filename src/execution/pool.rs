//! Worker Pool
//!
//! A bounded thread pool for the thread-per-instance strategy. Each job is
//! a whole workflow driver, so a worker stays busy for the lifetime of the
//! instance it picked up.
//!
//! - `min_workers` threads are started up front
//! - a new thread is added, up to `max_workers`, when no worker is free
//! - threads above `min_workers` exit after `keep_alive` without work
//! - the queue is either bounded (submission blocks when full) or unbounded

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error, info};

use super::panic_message;
use crate::error::EngineError;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum JobSender {
    Bounded(SyncSender<Job>),
    Unbounded(Sender<Job>),
}

impl JobSender {
    fn send(&self, job: Job) -> Result<(), mpsc::SendError<Job>> {
        match self {
            Self::Bounded(tx) => tx.send(job),
            Self::Unbounded(tx) => tx.send(job),
        }
    }
}

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub keep_alive: Duration,
    /// `None` for an unbounded queue
    pub queue_size: Option<usize>,
}

struct PoolState {
    receiver: Mutex<Receiver<Job>>,
    workers: AtomicUsize,
    idle: AtomicUsize,
    queued: AtomicUsize,
    active: AtomicUsize,
    min_workers: usize,
    keep_alive: Duration,
}

pub struct WorkerPool {
    sender: Mutex<Option<JobSender>>,
    state: Arc<PoolState>,
    max_workers: usize,
    next_id: AtomicUsize,
    shut_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, EngineError> {
        if config.max_workers == 0 || config.min_workers > config.max_workers {
            return Err(EngineError::Config(format!(
                "invalid pool size: min {} max {}",
                config.min_workers, config.max_workers
            )));
        }

        let (sender, receiver) = match config.queue_size {
            Some(size) => {
                let (tx, rx) = mpsc::sync_channel(size);
                (JobSender::Bounded(tx), rx)
            }
            None => {
                let (tx, rx) = mpsc::channel();
                (JobSender::Unbounded(tx), rx)
            }
        };

        let pool = Self {
            sender: Mutex::new(Some(sender)),
            state: Arc::new(PoolState {
                receiver: Mutex::new(receiver),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                min_workers: config.min_workers,
                keep_alive: config.keep_alive,
            }),
            max_workers: config.max_workers,
            next_id: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        };

        for _ in 0..config.min_workers {
            pool.spawn_worker()?;
        }

        info!(
            "Worker pool started: {}..{} workers, queue {}",
            config.min_workers,
            config.max_workers,
            config
                .queue_size
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string())
        );
        Ok(pool)
    }

    fn spawn_worker(&self) -> Result<(), EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&self.state);

        state.workers.fetch_add(1, Ordering::SeqCst);
        state.idle.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(format!("flowrunner-worker-{}", id))
            .spawn(move || worker_loop(id, state));

        if let Err(e) = spawned {
            self.state.workers.fetch_sub(1, Ordering::SeqCst);
            self.state.idle.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Dispatch(format!("unable to start worker thread: {}", e)));
        }

        debug!("Started worker {}", id);
        Ok(())
    }

    /// Queues a job, adding a worker when none is free.
    ///
    /// Blocks while a bounded queue is full.
    pub fn execute<F>(&self, job: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Dispatch("worker pool is shut down".to_string()));
        }

        let waiting = self.state.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state.idle.load(Ordering::SeqCst) < waiting
            && self.state.workers.load(Ordering::SeqCst) < self.max_workers
        {
            if let Err(e) = self.spawn_worker() {
                error!("{}", e);
            }
        }

        // Clone the sender out so a blocking send does not hold the lock
        let sent = {
            let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(JobSender::Bounded(tx)) => Some(JobSender::Bounded(tx.clone())),
                Some(JobSender::Unbounded(tx)) => Some(JobSender::Unbounded(tx.clone())),
                None => None,
            }
        }
        .map(|sender| sender.send(Box::new(job)));

        match sent {
            Some(Ok(())) => Ok(()),
            _ => {
                self.state.queued.fetch_sub(1, Ordering::SeqCst);
                Err(EngineError::Dispatch("worker pool is shut down".to_string()))
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.state.workers.load(Ordering::SeqCst)
    }

    /// Jobs currently running.
    pub fn active_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Stops accepting jobs. Queued jobs still run; workers exit once the
    /// queue drains.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, state: Arc<PoolState>) {
    loop {
        let message = {
            let receiver = state.receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv_timeout(state.keep_alive)
        };

        match message {
            Ok(job) => {
                state.queued.fetch_sub(1, Ordering::SeqCst);
                state.idle.fetch_sub(1, Ordering::SeqCst);
                state.active.fetch_add(1, Ordering::SeqCst);

                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!("Worker {} job panicked: {}", id, panic_message(payload.as_ref()));
                }

                state.active.fetch_sub(1, Ordering::SeqCst);
                state.idle.fetch_add(1, Ordering::SeqCst);
            }
            Err(RecvTimeoutError::Timeout) => {
                let current = state.workers.load(Ordering::SeqCst);
                if current > state.min_workers
                    && state
                        .workers
                        .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    state.idle.fetch_sub(1, Ordering::SeqCst);
                    debug!("Worker {} idle past keep-alive; exiting", id);
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                state.workers.fetch_sub(1, Ordering::SeqCst);
                state.idle.fetch_sub(1, Ordering::SeqCst);
                debug!("Worker {} exiting", id);
                return;
            }
        }
    }
}
