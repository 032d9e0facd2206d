//! # sqlgate
//!
//! The client-connection layer of a SQL server:
//! - Event-driven connections, one reactor per handler thread
//! - Per-connection state machine with optional TLS negotiation
//! - Pooled connection handles, reused when a descriptor comes back
//! - Length-prefixed command/response protocol
//! - Inline or background query execution
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Dispatcher                            │
//! │                 (accept, round-robin)                       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ get_or_create + assign
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                ConnectionHandleFactory                      │
//! │              (registry + pool by conn id)                   │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ Handler     │   ...    │ Handler     │   mio reactor per thread
//!   │ Task 0      │          │ Task N      │
//!   └──────┬──────┘          └──────┬──────┘
//!          │ drive()                │
//!          ▼                        ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ Connection  │          │ Connection  │──► TrafficCop ──► QueryEngine
//!   │ Handle      │          │ Handle      │       (inline or worker pool)
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod buffer;
pub mod protocol;
pub mod execution;
pub mod network;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{GateError, Result};
pub use config::Config;
pub use network::Server;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of sqlgate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
