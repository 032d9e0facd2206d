//! Connection statistics
//!
//! Shared counters updated by the dispatcher, factory and handles.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Connections refused because of `max_connections`
    pub connections_rejected: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Handles constructed by the factory
    pub handles_allocated: AtomicU64,
    /// Pooled handles handed out again
    pub handles_reused: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle_allocated(&self) {
        self.handles_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle_reused(&self) {
        self.handles_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Current number of active connections
    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}
