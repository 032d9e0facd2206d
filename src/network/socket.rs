//! Connection identity and transport
//!
//! A handle is keyed by the OS descriptor of its socket and talks to it
//! through the `Socket` trait object so tests can substitute socket pairs.

use std::fmt;
use std::io::{Read, Write};

use mio::event::Source;

/// Identifier of one transport connection (the raw socket descriptor for
/// accepted TCP connections). Unique among active connections only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub i32);

impl From<i32> for ConnectionId {
    fn from(fd: i32) -> Self {
        ConnectionId(fd)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A non-blocking, reactor-registrable byte stream
pub trait Socket: Read + Write + Source + Send {}

impl<T> Socket for T where T: Read + Write + Source + Send {}
