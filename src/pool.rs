//! Fixed-size worker pool.
//!
//! Jobs are queued on a crossbeam channel and picked up by whichever worker
//! is free. The pipeline submits one long-lived job per stage, so a pool
//! with fewer workers than stages leaves the trailing stages unscheduled.

use crate::error::{PipelineError, Result};
use crate::stage::panic_message;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads sharing one job queue
pub struct WorkerPool {
    name: String,
    tx: Option<Sender<Job>>,
    rx: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads named `{name}-worker-{i}`
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(PipelineError::Pool(format!(
                "pool '{name}' needs at least one worker"
            )));
        }

        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let jobs = rx.clone();
            let thread_name = format!("{name}-worker-{i}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(jobs))
                .map_err(|e| PipelineError::Pool(format!("failed to spawn {thread_name}: {e}")))?;
            workers.push(handle);
        }

        tracing::debug!(pool = %name, size, "worker pool started");
        Ok(Self {
            name,
            tx: Some(tx),
            rx,
            workers,
        })
    }

    /// Get the pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a free worker
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Queue a job and get a handle to its result
    pub fn submit<F, R>(&self, f: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::Pool(format!("pool '{}' is shut down", self.name)))?;

        let (done_tx, done_rx) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = done_tx.send(f());
        });
        tx.send(job)
            .map_err(|_| PipelineError::Pool(format!("pool '{}' has no workers", self.name)))?;

        Ok(TaskHandle { rx: done_rx })
    }

    /// Drop every job no worker has picked up yet. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let mut cleared = 0;
        while self.rx.try_recv().is_ok() {
            cleared += 1;
        }
        if cleared > 0 {
            tracing::debug!(pool = %self.name, cleared, "cleared queued jobs");
        }
        cleared
    }

    /// Stop accepting jobs.
    ///
    /// With `wait`, queued jobs still run and every worker is joined. Without
    /// it, queued jobs are dropped and running workers are detached.
    pub fn shutdown(&mut self, wait: bool) {
        if self.tx.take().is_none() && self.workers.is_empty() {
            return;
        }

        if wait {
            for handle in self.workers.drain(..) {
                if handle.join().is_err() {
                    tracing::error!(pool = %self.name, "worker thread panicked");
                }
            }
        } else {
            self.clear_queue();
            self.workers.clear();
        }
        tracing::debug!(pool = %self.name, wait, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn worker_loop(jobs: Receiver<Job>) {
    // Ends once every sender is gone and the queue is drained.
    for job in jobs.iter() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(panic = %panic_message(panic.as_ref()), "pool job panicked");
        }
    }
}

/// Completion handle for a submitted job
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the job finishes.
    ///
    /// Fails with `TaskCancelled` if the job was cleared from the queue or
    /// panicked.
    pub fn wait(self) -> Result<R> {
        self.rx.recv().map_err(|_| PipelineError::TaskCancelled)
    }

    /// Block up to `timeout`. `None` means the job is still running.
    ///
    /// The result can only be taken once.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(Ok(value)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PipelineError::TaskCancelled)),
        }
    }
}
