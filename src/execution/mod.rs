//! Execution Module
//!
//! The boundary between the connection layer and the query engine.
//!
//! ## Architecture
//! - `QueryExecutor`: what a connection submits commands to (one per handle)
//! - `TrafficCop`: the stock executor, inline or backed by a `WorkerPool`
//! - `QueryEngine`: the SQL engine seam the traffic cop calls into
//!
//! Queued work reports back through a `CompletionCallback`. The callback a
//! connection installs only posts a message to its handler task, so results
//! are always applied on the task's own thread.

mod adapter;
mod engine;
mod pool;
mod traffic_cop;

pub use adapter::{CompletionCallback, QueryExecutor, Submission};
pub use engine::{EchoEngine, QueryEngine, QueryResult};
pub use pool::WorkerPool;
pub use traffic_cop::TrafficCop;
