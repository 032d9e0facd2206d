//! Command definitions
//!
//! Represents commands from clients.

/// Command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Query = 0x01,
    Ping = 0x02,
    Terminate = 0x03,
}

impl CommandType {
    /// Map a wire type byte to a command type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CommandType::Query),
            0x02 => Some(CommandType::Ping),
            0x03 => Some(CommandType::Terminate),
            _ => None,
        }
    }
}

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Execute a SQL statement
    Query { sql: String },

    /// Ping (health check)
    Ping,

    /// Close the connection after flushing pending output
    Terminate,
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Query { .. } => CommandType::Query,
            Command::Ping => CommandType::Ping,
            Command::Terminate => CommandType::Terminate,
        }
    }

    /// Convenience constructor for a query
    pub fn query(sql: impl Into<String>) -> Self {
        Command::Query { sql: sql.into() }
    }
}
