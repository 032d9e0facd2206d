//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//!
//! ### Request (Command) Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Cmd (1)  │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Payload by Command Type
//! - QUERY:     UTF-8 statement text
//! - PING:      empty
//! - TERMINATE: empty
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```

use std::io::{Read, Write};

use bytes::{Buf, BufMut};

use super::{Command, CommandType, Response, Status};
use crate::error::{GateError, Result};

/// Header size: 1 byte command/status + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Frame Header
// =============================================================================

/// Type byte and payload length of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Header plus payload
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len
    }
}

/// Peek at a frame header without consuming anything.
///
/// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available.
pub fn peek_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let mut header = &bytes[..HEADER_SIZE];
    let kind = header.get_u8();
    let payload_len = header.get_u32() as usize;
    Some(FrameHeader { kind, payload_len })
}

// =============================================================================
// Command Encoding/Decoding
// =============================================================================

/// Encode a command to bytes
///
/// Format: cmd_type (1) + payload_len (4) + payload
pub fn encode_command(command: &Command) -> Vec<u8> {
    let payload: &[u8] = match command {
        Command::Query { sql } => sql.as_bytes(),
        Command::Ping | Command::Terminate => &[],
    };

    let mut message = Vec::with_capacity(HEADER_SIZE + payload.len());
    message.put_u8(command.command_type() as u8);
    message.put_u32(payload.len() as u32);
    message.put_slice(payload);

    message
}

/// Decode a command from bytes
pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    let header = peek_header(bytes).ok_or_else(|| {
        GateError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        ))
    })?;

    if header.payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(GateError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            header.payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    if bytes.len() < header.frame_len() {
        return Err(GateError::Protocol(format!(
            "Incomplete payload: expected {} bytes, got {}",
            header.frame_len(),
            bytes.len()
        )));
    }

    decode_command_payload(header.kind, &bytes[HEADER_SIZE..header.frame_len()])
}

/// Decode the payload of a command frame whose header was already parsed
pub fn decode_command_payload(kind: u8, payload: &[u8]) -> Result<Command> {
    match CommandType::from_byte(kind) {
        Some(CommandType::Query) => {
            let sql = std::str::from_utf8(payload).map_err(|_| {
                GateError::Protocol("QUERY command: statement is not valid UTF-8".to_string())
            })?;
            Ok(Command::Query {
                sql: sql.to_string(),
            })
        }
        Some(CommandType::Ping) => expect_empty("PING", payload).map(|_| Command::Ping),
        Some(CommandType::Terminate) => {
            expect_empty("TERMINATE", payload).map(|_| Command::Terminate)
        }
        None => Err(GateError::Protocol(format!(
            "Unknown command type: 0x{:02x}",
            kind
        ))),
    }
}

fn expect_empty(name: &str, payload: &[u8]) -> Result<()> {
    if !payload.is_empty() {
        return Err(GateError::Protocol(format!(
            "{} command: unexpected payload of {} bytes",
            name,
            payload.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response to bytes
///
/// Format: status (1) + payload_len (4) + payload
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut message = Vec::with_capacity(response.encoded_len());
    encode_response_into(response, &mut message);
    message
}

/// Encode a response into any `BufMut`
pub fn encode_response_into<B: BufMut>(response: &Response, out: &mut B) {
    let payload = response.payload.as_deref().unwrap_or(&[]);
    out.put_u8(response.status as u8);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let header = peek_header(bytes).ok_or_else(|| {
        GateError::Protocol(format!(
            "Incomplete response header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        ))
    })?;

    if header.payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(GateError::Protocol(format!(
            "Response payload too large: {} bytes (max {})",
            header.payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    if bytes.len() < header.frame_len() {
        return Err(GateError::Protocol(format!(
            "Incomplete response payload: expected {} bytes, got {}",
            header.frame_len(),
            bytes.len()
        )));
    }

    let status = Status::from_byte(header.kind).ok_or_else(|| {
        GateError::Protocol(format!(
            "Unknown response status: 0x{:02x}",
            header.kind
        ))
    })?;

    let payload = if header.payload_len > 0 {
        Some(bytes[HEADER_SIZE..header.frame_len()].to_vec())
    } else {
        None
    };

    Ok(Response { status, payload })
}

// =============================================================================
// Stream-based I/O helpers (blocking clients)
// =============================================================================

/// Read one frame (header + payload) from a blocking stream
fn read_frame<R: Read>(reader: &mut R, what: &str) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = (&header[1..]).get_u32() as usize;
    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(GateError::Protocol(format!(
            "{} payload too large: {} bytes (max {})",
            what, payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = vec![0u8; HEADER_SIZE + payload_len];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    if payload_len > 0 {
        reader.read_exact(&mut frame[HEADER_SIZE..])?;
    }
    Ok(frame)
}

/// Read a complete command from a stream
///
/// Blocks until a complete command is received or an error occurs
pub fn read_command<R: Read>(reader: &mut R) -> Result<Command> {
    let frame = read_frame(reader, "Command")?;
    decode_command(&frame)
}

/// Write a command to a stream
pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> Result<()> {
    let bytes = encode_command(command);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let frame = read_frame(reader, "Response")?;
    decode_response(&frame)
}

/// Read responses until the one that completes a command (OK, ERROR or PONG)
pub fn read_reply<R: Read>(reader: &mut R) -> Result<Vec<Response>> {
    let mut responses = Vec::new();
    loop {
        let response = read_response(reader)?;
        let last = response.status != Status::Row;
        responses.push(response);
        if last {
            return Ok(responses);
        }
    }
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let bytes = encode_response(response);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
