// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker threads for requests that may block on the backend

use crossbeam_queue::SegQueue;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, PoisonError,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use torrentfs_core::WorkerConfig;
use tracing::debug;

pub const WORKER_THREADS_ENV: &str = "TORRENTFS_FUSE_WORKER_THREADS";

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool fed by a lock-free queue.
///
/// Dropping the pool runs every job already queued before the threads exit.
pub struct WorkerPool {
    queue: Arc<SegQueue<Job>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Self {
        let queue = Arc::new(SegQueue::<Job>::new());
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(thread_count);

        for worker in 0..thread_count.max(1) {
            let queue = Arc::clone(&queue);
            let signal = Arc::clone(&signal);
            let shutdown = Arc::clone(&shutdown);
            let spawned = thread::Builder::new()
                .name(format!("torrentfs-worker-{worker}"))
                .spawn(move || worker_loop(&queue, &signal, &shutdown));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::error!(
                        target: "torrentfs::fuse",
                        worker,
                        %err,
                        "failed to spawn worker"
                    );
                }
            }
        }

        Self {
            queue,
            signal,
            shutdown,
            handles,
        }
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queue `job`. Runs it inline when no worker could be started.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.handles.is_empty() {
            job();
            return;
        }
        self.queue.push(Box::new(job));
        let (lock, cvar) = &*self.signal;
        let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        cvar.notify_one();
    }
}

fn worker_loop(queue: &SegQueue<Job>, signal: &(Mutex<bool>, Condvar), shutdown: &AtomicBool) {
    loop {
        match queue.pop() {
            Some(job) => job(),
            None if shutdown.load(Ordering::Acquire) => break,
            None => {
                let (lock, cvar) = signal;
                let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
                if !*pending {
                    pending = cvar
                        .wait_timeout(pending, Duration::from_millis(5))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                *pending = false;
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let (lock, cvar) = &*self.signal;
            let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = true;
            cvar.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!(target: "torrentfs::fuse", "worker pool stopped");
    }
}

/// Worker count: the environment override, then the configured value, then
/// the available parallelism (at least two).
pub fn worker_count(config: &WorkerConfig) -> usize {
    let from_env = std::env::var(WORKER_THREADS_ENV)
        .ok()
        .and_then(|value| value.parse::<usize>().ok());
    resolve_worker_count(from_env, config.threads)
}

fn resolve_worker_count(from_env: Option<usize>, configured: usize) -> usize {
    from_env
        .filter(|n| *n > 0)
        .or(Some(configured).filter(|n| *n > 0))
        .unwrap_or_else(|| thread::available_parallelism().map(|p| p.get()).unwrap_or(1).max(2))
}
