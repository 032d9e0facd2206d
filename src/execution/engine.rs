//! Query engine seam
//!
//! Parsing, planning and executing SQL live behind this trait.

use crate::error::Result;
use crate::protocol::Response;

/// Result of one successfully executed statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Result rows, each a list of textual column values
    pub rows: Vec<Vec<String>>,

    /// Completion tag, e.g. `SELECT 3`
    pub tag: String,
}

impl QueryResult {
    /// A result without rows
    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            rows: Vec::new(),
            tag: tag.into(),
        }
    }

    /// Wire responses: one ROW per row, then OK with the tag
    pub fn into_responses(self) -> Vec<Response> {
        let mut responses = Vec::with_capacity(self.rows.len() + 1);
        responses.extend(self.rows.iter().map(|row| Response::row(row.as_slice())));
        responses.push(Response::ok(&self.tag));
        responses
    }
}

/// Executes SQL statements
///
/// Called from handler threads (inline execution) or worker threads.
pub trait QueryEngine: Send + Sync {
    fn execute(&self, sql: &str) -> Result<QueryResult>;
}

/// Engine that answers every statement with a single row holding the
/// statement text. Stands in for a real engine when exercising the
/// connection layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoEngine;

impl QueryEngine for EchoEngine {
    fn execute(&self, sql: &str) -> Result<QueryResult> {
        let statement = sql.trim();
        if statement.is_empty() {
            return Ok(QueryResult::command("EMPTY"));
        }
        Ok(QueryResult {
            rows: vec![vec![statement.to_string()]],
            tag: "SELECT 1".to_string(),
        })
    }
}
