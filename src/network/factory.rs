//! Connection handle factory
//!
//! Owns the registry of every handle ever created, keyed by connection id.
//! Closed handles stay in the registry as a pool: when the OS hands out the
//! same descriptor again, the pooled handle is reset and rebound instead of
//! allocating fresh buffers.
//!
//! Lock order is registry first, then the individual handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::handle::{ConnectionHandle, SharedHandle};
use super::socket::{ConnectionId, Socket};
use super::stats::ConnectionStats;
use super::task::TaskShared;
use crate::error::{GateError, Result};
use crate::execution::{EchoEngine, QueryEngine, QueryExecutor, TrafficCop};
use crate::protocol::{FramedProtocol, ProtocolHandler};

type ProtocolFactory = Box<dyn Fn() -> Box<dyn ProtocolHandler> + Send + Sync>;
type ExecutorFactory = Box<dyn Fn() -> Box<dyn QueryExecutor> + Send + Sync>;

/// Creates, pools and hands out connection handles
pub struct ConnectionHandleFactory {
    handles: Mutex<HashMap<ConnectionId, SharedHandle>>,
    buffer_capacity: usize,
    tls: Option<Arc<rustls::ServerConfig>>,
    protocols: ProtocolFactory,
    executors: ExecutorFactory,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandleFactory {
    pub fn builder() -> FactoryBuilder {
        FactoryBuilder::default()
    }

    /// Get a ready handle for a freshly accepted connection.
    ///
    /// Reuses the pooled handle registered under `id` after resetting it, or
    /// creates one. Either way the handle comes back bound to `socket` and
    /// pinned to `task`, in its initial state. Fails if a handle with this id
    /// is still active, which means the id was handed out twice.
    pub fn get_or_create(
        &self,
        id: ConnectionId,
        socket: Box<dyn Socket>,
        task: &Arc<TaskShared>,
    ) -> Result<SharedHandle> {
        let mut handles = self.handles.lock();

        if let Some(existing) = handles.get(&id) {
            let shared = Arc::clone(existing);
            let mut handle = shared.lock();
            if !handle.is_pooled() {
                tracing::error!(
                    connection = %id,
                    state = ?handle.state(),
                    "Connection id handed out while its handle is active"
                );
                return Err(GateError::InternalInvariant(format!(
                    "{} is still active in state {:?}",
                    id,
                    handle.state()
                )));
            }

            handle.reset();
            handle.bind(socket, task);
            drop(handle);

            self.stats.handle_reused();
            self.stats.connection_opened();
            tracing::debug!(connection = %id, task = task.id(), "Reusing pooled handle");
            return Ok(shared);
        }

        let mut handle = ConnectionHandle::new(
            id,
            self.buffer_capacity,
            self.tls.clone(),
            (self.protocols)(),
            (self.executors)(),
            Arc::clone(&self.stats),
        );
        handle.bind(socket, task);

        let shared = Arc::new(Mutex::new(handle));
        handles.insert(id, Arc::clone(&shared));

        self.stats.handle_allocated();
        self.stats.connection_opened();
        tracing::debug!(connection = %id, task = task.id(), "Allocated new handle");
        Ok(shared)
    }

    /// The handle registered under `id`, active or pooled.
    ///
    /// For inspection only; connections are driven by their owning task.
    pub fn lookup(&self, id: ConnectionId) -> Option<SharedHandle> {
        self.handles.lock().get(&id).cloned()
    }

    /// Number of handles ever created and still registered
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles bound to a live connection
    pub fn active_count(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|h| !h.lock().is_pooled())
            .count()
    }

    /// Closed handles waiting for reuse
    pub fn pooled_count(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|h| h.lock().is_pooled())
            .count()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }
}

impl std::fmt::Debug for ConnectionHandleFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandleFactory")
            .field("handles", &self.len())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Builder for ConnectionHandleFactory
pub struct FactoryBuilder {
    buffer_capacity: usize,
    tls: Option<Arc<rustls::ServerConfig>>,
    protocols: Option<ProtocolFactory>,
    executors: Option<ExecutorFactory>,
    stats: Option<Arc<ConnectionStats>>,
}

impl Default for FactoryBuilder {
    fn default() -> Self {
        Self {
            buffer_capacity: 64 * 1024,
            tls: None,
            protocols: None,
            executors: None,
            stats: None,
        }
    }
}

impl FactoryBuilder {
    /// Set the capacity of each handle's receive and send buffer
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }

    /// Require transport security on every connection
    pub fn tls(mut self, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        self.tls = tls;
        self
    }

    /// Protocol handler installed in each new handle (default: `FramedProtocol`)
    pub fn protocol<F>(mut self, make: F) -> Self
    where
        F: Fn() -> Box<dyn ProtocolHandler> + Send + Sync + 'static,
    {
        self.protocols = Some(Box::new(make));
        self
    }

    /// Executor installed in each new handle (default: inline `EchoEngine`)
    pub fn executor<F>(mut self, make: F) -> Self
    where
        F: Fn() -> Box<dyn QueryExecutor> + Send + Sync + 'static,
    {
        self.executors = Some(Box::new(make));
        self
    }

    /// Share counters with the rest of the server
    pub fn stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> ConnectionHandleFactory {
        let capacity = self.buffer_capacity;
        let protocols = self.protocols.unwrap_or_else(|| {
            Box::new(move || Box::new(FramedProtocol::new(capacity)) as Box<dyn ProtocolHandler>)
        });
        let executors = self.executors.unwrap_or_else(|| {
            let engine: Arc<dyn QueryEngine> = Arc::new(EchoEngine);
            Box::new(move || Box::new(TrafficCop::new(Arc::clone(&engine))) as Box<dyn QueryExecutor>)
        });

        ConnectionHandleFactory {
            handles: Mutex::new(HashMap::new()),
            buffer_capacity: capacity,
            tls: self.tls,
            protocols,
            executors,
            stats: self.stats.unwrap_or_default(),
        }
    }
}
