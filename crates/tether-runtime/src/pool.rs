//! Shared general-purpose worker pool
//!
//! A fixed set of named threads draining one job channel. Jobs that panic
//! are logged and discarded; the worker thread keeps running.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Environment variable overriding the shared pool's thread count
pub const POOL_THREADS_ENV: &str = "TETHER_POOL_THREADS";

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub threads: usize,

    /// Thread name prefix; workers are named `{name}-{index}`
    pub name: String,

    /// How long shutdown waits for each worker before detaching it
    pub join_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            name: "tether-pool".to_string(),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    /// Default configuration, with the thread count taken from
    /// `TETHER_POOL_THREADS` when it holds a positive integer
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threads) = std::env::var(POOL_THREADS_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            config.threads = threads;
        }
        config
    }

    /// Configuration with a fixed thread count
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }
}

static SHARED_POOL: Lazy<Arc<WorkerPool>> =
    Lazy::new(|| Arc::new(WorkerPool::new(PoolConfig::from_env())));

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    /// Job sender; `None` once the pool is shut down
    jobs: RwLock<Option<Sender<Job>>>,

    /// Worker thread handles
    handles: Mutex<Vec<JoinHandle<()>>>,

    /// Shutdown signal
    shutdown: Arc<AtomicBool>,

    /// Number of workers that actually started
    threads: usize,

    /// Shutdown join timeout per worker
    join_timeout: Duration,
}

impl WorkerPool {
    /// Start a pool with the given configuration
    ///
    /// Workers the OS refuses to start are logged and skipped. A pool left
    /// with no workers runs every job inline on the submitting thread.
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(config.threads);

        for i in 0..config.threads {
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, i))
                .spawn(move || Self::worker_loop(rx, shutdown));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(pool = %config.name, worker = i, error = %e, "failed to spawn pool worker"),
            }
        }

        let threads = handles.len();
        tracing::debug!(pool = %config.name, threads, "worker pool started");

        Self {
            jobs: RwLock::new(Some(tx)),
            handles: Mutex::new(handles),
            shutdown,
            threads,
            join_timeout: config.join_timeout,
        }
    }

    /// Get the process-wide shared pool
    pub fn shared() -> Arc<WorkerPool> {
        SHARED_POOL.clone()
    }

    /// Number of running worker threads
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Number of jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.jobs.read().as_ref().map_or(0, Sender::len)
    }

    /// Submit a job
    ///
    /// Jobs submitted after shutdown are dropped without running.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.threads == 0 {
            Self::run_job(Box::new(job));
            return;
        }

        let rejected = match self.jobs.read().as_ref() {
            Some(tx) => tx.send(Box::new(job)).err().map(|e| e.into_inner()),
            None => Some(Box::new(job) as Job),
        };
        if let Some(job) = rejected {
            tracing::trace!("dropping job submitted to a stopped pool");
            drop(job);
        }
    }

    /// Stop accepting jobs, let workers finish what is queued, and join them
    pub fn shutdown(&self) {
        if self.jobs.write().take().is_none() {
            return;
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            Self::join_with_timeout(handle, self.join_timeout);
        }
        self.shutdown.store(true, Ordering::Release);
    }

    /// Wait up to `timeout` for a worker to drain and exit
    ///
    /// A worker still busy with a long job at the deadline is left running
    /// detached so shutdown never hangs on user code.
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                let worker = handle.thread().name().unwrap_or("<unnamed>").to_string();
                tracing::warn!(%worker, "pool worker still busy at shutdown; detaching");
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            tracing::error!("pool worker exited by panic");
        }
    }

    fn worker_loop(jobs: Receiver<Job>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Acquire) {
            let job = match jobs.recv_timeout(Duration::from_millis(100)) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            Self::run_job(job);
        }
    }

    fn run_job(job: Job) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let error = tether_core::TaskError::from_panic(payload.as_ref());
            tracing::warn!(%error, "pool job panicked");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
