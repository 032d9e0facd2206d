//! Response definitions
//!
//! Represents responses to clients. A single command may produce several
//! responses: one `Row` per result row followed by `Ok` or `Error`.

use bytes::{Buf, BufMut};

use crate::error::{GateError, Result};

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Command complete; payload is the completion tag
    Ok = 0x00,
    /// One result row; payload is the encoded columns
    Row = 0x01,
    /// Command failed; payload is the message
    Error = 0x02,
    /// Reply to PING
    Pong = 0x03,
}

impl Status {
    /// Map a wire status byte to a status
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Status::Ok),
            0x01 => Some(Status::Row),
            0x02 => Some(Status::Error),
            0x03 => Some(Status::Pong),
            _ => None,
        }
    }
}

/// A response to send to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code
    pub status: Status,

    /// Optional payload (tag for OK, columns for ROW, message for ERROR)
    pub payload: Option<Vec<u8>>,
}

impl Response {
    /// Create an OK response carrying a completion tag
    pub fn ok(tag: &str) -> Self {
        Self {
            status: Status::Ok,
            payload: if tag.is_empty() {
                None
            } else {
                Some(tag.as_bytes().to_vec())
            },
        }
    }

    /// Create a ROW response
    ///
    /// Columns are encoded as a u16 count followed by u32-length-prefixed
    /// UTF-8 values.
    pub fn row<S: AsRef<str>>(columns: &[S]) -> Self {
        let size = 2 + columns.iter().map(|c| 4 + c.as_ref().len()).sum::<usize>();
        let mut payload = Vec::with_capacity(size);
        payload.put_u16(columns.len() as u16);
        for column in columns {
            let column = column.as_ref().as_bytes();
            payload.put_u32(column.len() as u32);
            payload.put_slice(column);
        }
        Self {
            status: Status::Row,
            payload: Some(payload),
        }
    }

    /// Create an ERROR response
    pub fn error(message: &str) -> Self {
        Self {
            status: Status::Error,
            payload: Some(message.as_bytes().to_vec()),
        }
    }

    /// Create a PONG response
    pub fn pong() -> Self {
        Self {
            status: Status::Pong,
            payload: None,
        }
    }

    /// Payload interpreted as UTF-8 text (tag or error message)
    pub fn text(&self) -> Option<String> {
        self.payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    /// Decode the columns of a ROW response
    pub fn columns(&self) -> Result<Vec<String>> {
        if self.status != Status::Row {
            return Err(GateError::Protocol(format!(
                "Expected ROW response, got {:?}",
                self.status
            )));
        }
        let mut payload: &[u8] = self.payload.as_deref().unwrap_or(&[]);
        if payload.remaining() < 2 {
            return Err(GateError::Protocol("ROW: missing column count".to_string()));
        }
        let count = payload.get_u16() as usize;
        let mut columns = Vec::with_capacity(count);
        for index in 0..count {
            if payload.remaining() < 4 {
                return Err(GateError::Protocol(format!(
                    "ROW: missing length of column {}",
                    index
                )));
            }
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return Err(GateError::Protocol(format!(
                    "ROW: incomplete column {} (expected {}, got {})",
                    index,
                    len,
                    payload.remaining()
                )));
            }
            let value = String::from_utf8(payload[..len].to_vec()).map_err(|_| {
                GateError::Protocol(format!("ROW: column {} is not valid UTF-8", index))
            })?;
            payload.advance(len);
            columns.push(value);
        }
        Ok(columns)
    }

    /// Size of this response on the wire
    pub fn encoded_len(&self) -> usize {
        super::codec::HEADER_SIZE + self.payload.as_ref().map_or(0, Vec::len)
    }
}
