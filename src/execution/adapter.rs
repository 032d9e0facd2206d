//! Executor boundary
//!
//! Contract between a connection handle and whatever runs its commands.

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{Command, Response};

/// Invoked exactly once per queued submission with the final responses
pub type CompletionCallback = Arc<dyn Fn(Vec<Response>) + Send + Sync>;

/// Outcome of [`QueryExecutor::submit`]
#[derive(Debug)]
pub enum Submission {
    /// Finished inline; responses are ready to encode
    Completed(Vec<Response>),

    /// Handed to a background worker; the completion callback will fire
    Queued,
}

/// Runs commands on behalf of one connection
///
/// Implementations are owned by a connection handle and live as long as it
/// does, across reuse.
pub trait QueryExecutor: Send {
    /// Submit one command.
    ///
    /// Engine-level failures belong in the returned responses as an ERROR
    /// response. An `Err` here means the executor itself is unusable and the
    /// connection will be closed.
    fn submit(&mut self, command: Command) -> Result<Submission>;

    /// Install the callback used for queued submissions. Called every time
    /// the owning handle is bound to a connection.
    fn set_completion_callback(&mut self, callback: CompletionCallback);

    /// Whether a queued submission has not reported back yet
    fn is_queuing(&self) -> bool;

    /// Restore a state usable for an unrelated future connection
    fn reset(&mut self);
}
