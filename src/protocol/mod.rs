//! Protocol Module
//!
//! Defines the wire protocol for client-server communication.
//!
//! ## Protocol Format
//!
//! ### Request Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Cmd (1)  │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Commands
//! - 0x01: QUERY     - Payload: SQL text
//! - 0x02: PING      - Payload: empty
//! - 0x03: TERMINATE - Payload: empty
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Status Codes
//! - 0x00: OK    (completion tag)
//! - 0x01: ROW   (encoded columns)
//! - 0x02: ERROR (message)
//! - 0x03: PONG
//!
//! Transport security negotiation (type 0x20) is handled by the connection
//! itself before this protocol takes over; see `network::security`.

mod command;
mod response;
mod codec;
mod handler;

pub use command::{Command, CommandType};
pub use response::{Response, Status};
pub use codec::{
    decode_command, decode_command_payload, decode_response, encode_command,
    encode_response, encode_response_into, peek_header, read_command, read_reply,
    read_response, write_command, write_response, FrameHeader, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use handler::{FramedProtocol, ProtocolHandler};
