//! Protocol handler
//!
//! The capability a connection uses to turn receive-buffer bytes into
//! commands and responses into send-buffer bytes. One instance lives inside
//! each pooled connection handle and is reset, never recreated, on reuse.

use bytes::Buf;

use super::codec::{self, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use super::{Command, Response};
use crate::buffer::Buffer;
use crate::error::{GateError, Result};

/// Decodes client commands and encodes server responses
pub trait ProtocolHandler: Send {
    /// Decode the next command from `buf`.
    ///
    /// `Ok(None)` means the buffered bytes do not yet form a complete frame;
    /// nothing is consumed in that case. An error means the stream can no
    /// longer be trusted and the connection must close.
    fn decode(&mut self, buf: &mut Buffer) -> Result<Option<Command>>;

    /// Encode `response` into `buf`.
    ///
    /// Returns `Ok(false)` without writing when `buf` has no room yet, and an
    /// error when the response could never fit.
    fn encode(&mut self, response: &Response, buf: &mut Buffer) -> Result<bool>;

    /// Restore the initial state for an unrelated connection
    fn reset(&mut self);
}

/// Length-prefixed framing (see [`codec`])
#[derive(Debug)]
pub struct FramedProtocol {
    /// Largest payload accepted; frames must fit the receive buffer whole
    max_payload: usize,
    frames_decoded: u64,
    frames_encoded: u64,
}

impl FramedProtocol {
    /// Create a handler for buffers of `buffer_capacity` bytes
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            max_payload: buffer_capacity
                .saturating_sub(HEADER_SIZE)
                .min(MAX_PAYLOAD_SIZE as usize),
            frames_decoded: 0,
            frames_encoded: 0,
        }
    }

    /// Largest payload this handler accepts
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Commands decoded since construction or the last reset
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Responses encoded since construction or the last reset
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    fn check_header(&self, header: &FrameHeader) -> Result<()> {
        if header.payload_len > self.max_payload {
            return Err(GateError::Protocol(format!(
                "Frame too large: {} byte payload (max {})",
                header.payload_len, self.max_payload
            )));
        }
        Ok(())
    }
}

impl ProtocolHandler for FramedProtocol {
    fn decode(&mut self, buf: &mut Buffer) -> Result<Option<Command>> {
        let header = match codec::peek_header(buf.readable()) {
            Some(header) => header,
            None => return Ok(None),
        };
        self.check_header(&header)?;

        if buf.len() < header.frame_len() {
            return Ok(None);
        }

        let command = codec::decode_command_payload(
            header.kind,
            &buf.readable()[HEADER_SIZE..header.frame_len()],
        )?;
        buf.advance(header.frame_len());
        self.frames_decoded += 1;

        Ok(Some(command))
    }

    fn encode(&mut self, response: &Response, buf: &mut Buffer) -> Result<bool> {
        let frame_len = response.encoded_len();
        if frame_len > buf.capacity() {
            return Err(GateError::Protocol(format!(
                "Response of {} bytes exceeds send buffer capacity {}",
                frame_len,
                buf.capacity()
            )));
        }
        if frame_len > buf.available() {
            return Ok(false);
        }

        let mut frame = [0u8; HEADER_SIZE];
        let payload = response.payload.as_deref().unwrap_or(&[]);
        frame[0] = response.status as u8;
        frame[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        // Both fit: checked against available() above
        buf.put_slice(&frame);
        buf.put_slice(payload);
        self.frames_encoded += 1;

        Ok(true)
    }

    fn reset(&mut self) {
        self.frames_decoded = 0;
        self.frames_encoded = 0;
    }
}
