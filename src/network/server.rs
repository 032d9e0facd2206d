//! TCP Server
//!
//! Wires the pieces together: one dispatcher on the calling thread, one
//! thread per handler task, and an optional execution worker pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::dispatcher::{Dispatcher, ShutdownHandle};
use super::factory::ConnectionHandleFactory;
use super::stats::ConnectionStats;
use super::task::ConnectionHandlerTask;
use crate::config::Config;
use crate::error::{GateError, Result};
use crate::execution::{QueryEngine, QueryExecutor, TrafficCop, WorkerPool};
use crate::protocol::HEADER_SIZE;

/// TCP server for sqlgate
pub struct Server {
    config: Config,
    dispatcher: Dispatcher,
    tasks: Vec<ConnectionHandlerTask>,
    factory: Arc<ConnectionHandleFactory>,
    stats: Arc<ConnectionStats>,
}

impl Server {
    /// Create a new server with the given config and engine.
    ///
    /// Binds the listen address right away; connections queue in the
    /// backlog until [`Server::run`].
    pub fn new(config: Config, engine: Arc<dyn QueryEngine>) -> Result<Self> {
        if config.buffer_capacity <= HEADER_SIZE {
            return Err(GateError::Config(format!(
                "buffer capacity must exceed the {} byte frame header",
                HEADER_SIZE
            )));
        }
        let addr: SocketAddr = config.listen_addr.parse().map_err(|e| {
            GateError::Config(format!("invalid listen address {}: {}", config.listen_addr, e))
        })?;

        let pool = match config.execution_threads {
            0 => None,
            threads => Some(Arc::new(WorkerPool::new(threads)?)),
        };
        let stats = Arc::new(ConnectionStats::new());

        let factory = Arc::new(
            ConnectionHandleFactory::builder()
                .buffer_capacity(config.buffer_capacity)
                .tls(config.tls.clone())
                .stats(Arc::clone(&stats))
                .executor(move || -> Box<dyn QueryExecutor> {
                    match &pool {
                        Some(pool) => {
                            Box::new(TrafficCop::with_pool(Arc::clone(&engine), Arc::clone(pool)))
                        }
                        None => Box::new(TrafficCop::new(Arc::clone(&engine))),
                    }
                })
                .build(),
        );

        let tasks = (0..config.handler_threads.max(1))
            .map(|id| ConnectionHandlerTask::new(id, config.max_events))
            .collect::<Result<Vec<_>>>()?;
        let shared = tasks.iter().map(|task| Arc::clone(task.shared())).collect();

        let dispatcher = Dispatcher::bind(addr, Arc::clone(&factory), shared, config.max_connections)?;

        tracing::debug!(
            handler_threads = tasks.len(),
            execution_threads = config.execution_threads,
            tls = config.tls.is_some(),
            "Server configured"
        );

        Ok(Self {
            config,
            dispatcher,
            tasks,
            factory,
            stats,
        })
    }

    /// Address the server listens on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.dispatcher.local_addr()
    }

    /// Handle that stops [`Server::run`] from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.dispatcher.shutdown_handle()
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub fn factory(&self) -> &Arc<ConnectionHandleFactory> {
        &self.factory
    }

    /// Start the server (blocking until shut down)
    pub fn run(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(GateError::Network("server already ran".to_string()));
        }
        let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);

        let mut threads = Vec::with_capacity(self.tasks.len());
        for mut task in self.tasks.drain(..) {
            let thread = thread::Builder::new()
                .name(format!("sqlgate-net-{}", task.id()))
                .spawn(move || task.run(poll_timeout))?;
            threads.push(thread);
        }

        let result = self.dispatcher.run(poll_timeout);

        for task in self.dispatcher.tasks() {
            if let Err(e) = task.shutdown() {
                tracing::debug!("Task {} already stopped: {}", task.id(), e);
            }
        }
        for thread in threads {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Handler task failed: {}", e),
                Err(_) => tracing::error!("Handler task panicked"),
            }
        }

        result
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.dispatcher.shutdown_handle().shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_addr", &self.config.listen_addr)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
