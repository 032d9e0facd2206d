//! Error types for sqlgate
//!
//! Provides a unified error type for the connection layer. How each variant
//! is handled (close, respond, abort the task) is decided by the connection
//! state machine, not by the code that raises it.

use thiserror::Error;

/// Result type alias using GateError
pub type Result<T> = std::result::Result<T, GateError>;

/// Unified error type for sqlgate operations
#[derive(Debug, Error)]
pub enum GateError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Transport Security Errors
    // -------------------------------------------------------------------------
    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    // -------------------------------------------------------------------------
    // Wire Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Execution Errors
    // -------------------------------------------------------------------------
    #[error("Execution error: {0}")]
    Execution(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Invariant Violations
    // -------------------------------------------------------------------------
    /// Pooling or reactor bookkeeping is corrupt. Never recovered locally.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl GateError {
    /// Whether this error indicates corrupted internal state rather than a
    /// misbehaving peer.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, GateError::InternalInvariant(_))
    }
}
