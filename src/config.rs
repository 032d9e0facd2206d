//! Configuration for sqlgate
//!
//! Centralized configuration with sensible defaults.

use std::sync::Arc;

/// Main configuration for a sqlgate server
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    // -------------------------------------------------------------------------
    // Reactor Configuration
    // -------------------------------------------------------------------------
    /// Number of connection handler threads (one reactor each)
    pub handler_threads: usize,

    /// Upper bound on the time a reactor blocks in one poll (milliseconds)
    pub poll_timeout_ms: u64,

    /// Readiness events fetched per poll
    pub max_events: usize,

    // -------------------------------------------------------------------------
    // Connection Configuration
    // -------------------------------------------------------------------------
    /// Capacity of each connection's receive and send buffer (in bytes).
    /// Also bounds the largest frame a client may send.
    pub buffer_capacity: usize,

    /// Server-side TLS. When set, every connection starts by negotiating
    /// transport security.
    pub tls: Option<Arc<rustls::ServerConfig>>,

    // -------------------------------------------------------------------------
    // Execution Configuration
    // -------------------------------------------------------------------------
    /// Background query threads. Zero executes queries inline on the
    /// handler thread.
    pub execution_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:15432".to_string(),
            max_connections: 1024,
            handler_threads: 4,
            poll_timeout_ms: 100,
            max_events: 256,
            buffer_capacity: 64 * 1024, // 64 KB
            tls: None,
            execution_threads: 4,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the number of connection handler threads
    pub fn handler_threads(mut self, count: usize) -> Self {
        self.config.handler_threads = count.max(1);
        self
    }

    /// Set the reactor poll timeout (in milliseconds)
    pub fn poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.poll_timeout_ms = ms;
        self
    }

    /// Set the number of events fetched per poll
    pub fn max_events(mut self, count: usize) -> Self {
        self.config.max_events = count.max(1);
        self
    }

    /// Set the per-connection buffer capacity (in bytes)
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.config.buffer_capacity = bytes;
        self
    }

    /// Require transport security negotiation with the given rustls config
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Set the number of background execution threads (0 = inline)
    pub fn execution_threads(mut self, count: usize) -> Self {
        self.config.execution_threads = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
