//! Background worker pool
//!
//! Fixed set of threads pulling jobs from a crossbeam channel.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::error::{GateError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Threads that run queued query executions
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(GateError::Config(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);

        for index in 0..threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("sqlgate-exec-{}", index))
                .spawn(move || {
                    // Ends once every sender is gone and the queue is drained
                    for job in receiver.iter() {
                        job();
                    }
                })?;
            workers.push(worker);
        }

        tracing::debug!("Started {} execution worker(s)", threads);

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| GateError::Execution("worker pool is shut down".to_string()))?;
        sender
            .send(Box::new(job))
            .map_err(|_| GateError::Execution("worker pool is shut down".to_string()))
    }

    /// Stop accepting jobs, let queued ones finish, join the workers
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Execution worker panicked");
            }
        }
        tracing::debug!("Execution workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
