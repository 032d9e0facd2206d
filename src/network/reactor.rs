//! Readiness reactor
//!
//! Each handler task owns one `Reactor`: a `mio` registry plus a table of
//! live registrations. Socket registrations (readable, writable) are backed
//! by `mio`; work-ready registrations are bookkeeping only and fire when a
//! completion message for the connection reaches the task.
//!
//! Every registration gets a fresh token, and tokens are never reused, so an
//! event that was already fetched for a registration removed in the same
//! poll round can no longer be routed to an unrelated connection.

use std::collections::HashMap;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use super::socket::ConnectionId;
use crate::error::{GateError, Result};

/// Token reserved for the task's waker
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// First token handed to a registration
const FIRST_EVENT_TOKEN: usize = 1;

/// What a registration waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Socket has bytes to read (or hung up)
    Readable,
    /// Socket accepts more bytes after a partial write
    Writable,
    /// Background execution for the connection completed
    WorkReady,
}

impl EventKind {
    fn interest(self) -> Option<Interest> {
        match self {
            EventKind::Readable => Some(Interest::READABLE),
            EventKind::Writable => Some(Interest::WRITABLE),
            EventKind::WorkReady => None,
        }
    }
}

/// Opaque reference to a registration, kept by the handle until unregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventRef(Token);

impl EventRef {
    pub fn token(&self) -> Token {
        self.0
    }
}

/// A live registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub connection: ConnectionId,
    pub kind: EventKind,
}

#[derive(Default)]
struct Registrations {
    entries: HashMap<Token, Registration>,
    next_token: usize,
}

/// One handler task's event registrations
pub struct Reactor {
    registry: Registry,
    registrations: Mutex<Registrations>,
}

impl Reactor {
    pub(crate) fn new(registry: Registry) -> Self {
        Self {
            registry,
            registrations: Mutex::new(Registrations {
                entries: HashMap::new(),
                next_token: FIRST_EVENT_TOKEN,
            }),
        }
    }

    /// Arm a readiness notification for `connection`.
    ///
    /// Socket kinds need the connection's socket as `source`; a source may
    /// carry only one socket registration at a time.
    pub fn register(
        &self,
        connection: ConnectionId,
        kind: EventKind,
        source: Option<&mut dyn Source>,
    ) -> Result<EventRef> {
        let mut registrations = self.registrations.lock();
        let token = Token(registrations.next_token);

        if let Some(interest) = kind.interest() {
            let source = source.ok_or_else(|| {
                GateError::InternalInvariant(format!(
                    "{:?} registration for {} without a socket",
                    kind, connection
                ))
            })?;
            self.registry.register(source, token, interest)?;
        }

        registrations.next_token += 1;
        registrations
            .entries
            .insert(token, Registration { connection, kind });
        tracing::trace!(%connection, ?kind, token = token.0, "Event registered");

        Ok(EventRef(token))
    }

    /// Remove a registration.
    ///
    /// Idempotent: unknown or already removed references are ignored.
    /// Returns whether a registration was actually removed.
    pub fn unregister(&self, event: EventRef, source: Option<&mut dyn Source>) -> bool {
        let removed = self.registrations.lock().entries.remove(&event.0);
        let registration = match removed {
            Some(registration) => registration,
            None => return false,
        };

        if registration.kind.interest().is_some() {
            if let Some(source) = source {
                if let Err(e) = self.registry.deregister(source) {
                    // The descriptor may already be closed, which removes it
                    // from the poller anyway
                    tracing::debug!(
                        connection = %registration.connection,
                        "Deregister failed: {}",
                        e
                    );
                }
            }
        }
        tracing::trace!(
            connection = %registration.connection,
            kind = ?registration.kind,
            token = event.0 .0,
            "Event unregistered"
        );
        true
    }

    /// Resolve a polled token to its registration
    pub fn resolve(&self, token: Token) -> Option<Registration> {
        self.registrations.lock().entries.get(&token).copied()
    }

    /// Whether `event` is still registered
    pub fn is_registered(&self, event: EventRef) -> bool {
        self.registrations.lock().entries.contains_key(&event.0)
    }

    /// Kind of a live registration
    pub fn kind_of(&self, event: EventRef) -> Option<EventKind> {
        self.resolve(event.0).map(|r| r.kind)
    }

    /// Number of live registrations belonging to `connection`
    pub fn registrations_for(&self, connection: ConnectionId) -> usize {
        self.registrations
            .lock()
            .entries
            .values()
            .filter(|r| r.connection == connection)
            .count()
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.registrations.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registrations", &self.len())
            .finish()
    }
}
