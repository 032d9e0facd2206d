//! Traffic cop
//!
//! The stock `QueryExecutor`. Answers PING inline and routes statements to
//! the query engine, either on the calling thread or on the worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::adapter::{CompletionCallback, QueryExecutor, Submission};
use super::engine::QueryEngine;
use super::pool::WorkerPool;
use crate::error::{GateError, Result};
use crate::protocol::{Command, Response};

/// Per-connection executor in front of a shared engine
pub struct TrafficCop {
    engine: Arc<dyn QueryEngine>,

    /// Background workers; `None` executes inline
    pool: Option<Arc<WorkerPool>>,

    callback: Option<CompletionCallback>,

    /// Set while a queued statement has not completed
    queuing: Arc<AtomicBool>,

    /// Statements submitted since construction or the last reset
    statements: u64,
}

impl TrafficCop {
    /// Executor running statements inline
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            engine,
            pool: None,
            callback: None,
            queuing: Arc::new(AtomicBool::new(false)),
            statements: 0,
        }
    }

    /// Executor queuing statements on `pool`
    pub fn with_pool(engine: Arc<dyn QueryEngine>, pool: Arc<WorkerPool>) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new(engine)
        }
    }

    /// Statements submitted since construction or the last reset
    pub fn statements(&self) -> u64 {
        self.statements
    }

    fn run(engine: &dyn QueryEngine, sql: &str) -> Vec<Response> {
        match engine.execute(sql) {
            Ok(result) => result.into_responses(),
            Err(e) => {
                tracing::debug!("Statement failed: {}", e);
                vec![Response::error(&e.to_string())]
            }
        }
    }
}

impl QueryExecutor for TrafficCop {
    fn submit(&mut self, command: Command) -> Result<Submission> {
        let sql = match command {
            Command::Ping => return Ok(Submission::Completed(vec![Response::pong()])),
            Command::Terminate => {
                return Err(GateError::InternalInvariant(
                    "TERMINATE reached the executor".to_string(),
                ))
            }
            Command::Query { sql } => sql,
        };
        self.statements += 1;

        let pool = match &self.pool {
            Some(pool) => pool,
            None => return Ok(Submission::Completed(Self::run(&*self.engine, &sql))),
        };

        let callback = self.callback.clone().ok_or_else(|| {
            GateError::Execution("no completion callback registered".to_string())
        })?;
        if self.queuing.swap(true, Ordering::AcqRel) {
            return Err(GateError::InternalInvariant(
                "statement submitted while another is queued".to_string(),
            ));
        }

        let engine = Arc::clone(&self.engine);
        let queuing = Arc::clone(&self.queuing);
        let queued = pool.spawn(move || {
            let responses = Self::run(&*engine, &sql);
            queuing.store(false, Ordering::Release);
            callback(responses);
        });
        if let Err(e) = queued {
            self.queuing.store(false, Ordering::Release);
            return Err(e);
        }

        Ok(Submission::Queued)
    }

    fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.callback = Some(callback);
    }

    fn is_queuing(&self) -> bool {
        self.queuing.load(Ordering::Acquire)
    }

    fn reset(&mut self) {
        // An abandoned job still holds the old flag; give it its own
        if self.is_queuing() {
            self.queuing = Arc::new(AtomicBool::new(false));
        }
        self.callback = None;
        self.statements = 0;
    }
}
