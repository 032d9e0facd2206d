//! Network Module
//!
//! Client connection handling on top of per-thread `mio` reactors.
//!
//! ## Architecture
//! - `Dispatcher`: single accept thread, pins each connection to a task
//! - `ConnectionHandlerTask`: one per thread, drives its connections
//! - `ConnectionHandle`: per-connection state machine, pooled for reuse
//! - `ConnectionHandleFactory`: registry and pool of handles by connection id
//! - `Reactor`: a task's readiness registrations

mod dispatcher;
mod factory;
mod handle;
mod reactor;
mod security;
mod server;
mod socket;
mod stats;
mod task;

pub use dispatcher::{Dispatcher, ShutdownHandle};
pub use factory::{ConnectionHandleFactory, FactoryBuilder};
pub use handle::{ConnState, ConnectionHandle, SharedHandle, Step, Wakeup};
pub use reactor::{EventKind, EventRef, Reactor, Registration};
pub use security::{
    encode_request, load_server_tls, parse_request, Negotiation, SecurityState,
    SECURITY_ACCEPT, SECURITY_PROTOCOL_VERSION, SECURITY_REQUEST, SECURITY_REQUEST_LEN,
};
pub use server::Server;
pub use socket::{ConnectionId, Socket};
pub use stats::ConnectionStats;
pub use task::{ConnectionHandlerTask, TaskShared};
