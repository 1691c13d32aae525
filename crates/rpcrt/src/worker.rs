//! Worker pool with an idle-worker cap
//!
//! Jobs are boxed futures pulled from a mutex-guarded queue by worker tasks.
//! Every queued job is matched by an idle worker or a new one, so a job never
//! waits behind a job that is itself waiting on it. Idle workers exit after
//! `idle_timeout` as long as at least `max_idle_workers` other workers are
//! still idle.
//!
//! The server dispatch loop and apartment-threaded client calls share one pool.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, trace};

/// Unit of work run by the pool
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker pool policy
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Idle workers kept alive after their idle timeout
    pub max_idle_workers: usize,
    /// How long a worker waits for work before considering exit
    pub idle_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_workers: 1,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_max_idle_workers(mut self, max_idle_workers: usize) -> Self {
        self.max_idle_workers = max_idle_workers;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    idle: usize,
    peak: usize,
}

struct Shared {
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    /// One permit per job handed to an idle worker
    work_ready: Semaphore,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub idle_workers: usize,
    pub peak_workers: usize,
    pub queued: usize,
    pub completed: u64,
    pub panicked: u64,
}

/// Pool of worker tasks
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState::default()),
                work_ready: Semaphore::new(0),
                completed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Queue a job. Must be called from within a tokio runtime.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let spawn = {
            let mut state = self.shared.state.lock();
            state.queue.push_back(Box::pin(job));
            // Each idle worker absorbs at most one queued job, including idle
            // workers already woken but not yet back at the queue.
            if state.queue.len() > state.idle {
                state.workers += 1;
                state.peak = state.peak.max(state.workers);
                true
            } else {
                false
            }
        };

        if spawn {
            let shared = self.shared.clone();
            tokio::spawn(worker_loop(shared));
        } else {
            self.shared.work_ready.add_permits(1);
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.shared.state.lock();
        WorkerPoolStats {
            workers: state.workers,
            idle_workers: state.idle,
            peak_workers: state.peak,
            queued: state.queue.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }

    pub fn workers(&self) -> usize {
        self.shared.state.lock().workers
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    let id = {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    };
    debug!(worker = id, "worker started");

    let mut job = next_job(&shared);
    loop {
        if let Some(next) = job.take() {
            if AssertUnwindSafe(next).catch_unwind().await.is_err() {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker = id, "job panicked");
            }
            shared.completed.fetch_add(1, Ordering::Relaxed);
            job = next_job(&shared);
            continue;
        }

        let woken = match tokio::time::timeout(shared.config.idle_timeout, shared.work_ready.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        };

        let mut state = shared.state.lock();
        job = state.queue.pop_front();
        if job.is_some() {
            state.idle -= 1;
            continue;
        }
        if !woken && state.idle > shared.config.max_idle_workers {
            state.idle -= 1;
            state.workers -= 1;
            drop(state);
            debug!(worker = id, "idle worker exiting");
            return;
        }
        trace!(worker = id, woken, "worker still idle");
    }
}

/// Pop the next job, or count the caller as idle when the queue is empty
fn next_job(shared: &Shared) -> Option<Job> {
    let mut state = shared.state.lock();
    let job = state.queue.pop_front();
    if job.is_none() {
        state.idle += 1;
    }
    job
}
