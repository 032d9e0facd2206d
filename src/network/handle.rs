//! Connection handle
//!
//! All state of one client connection and the state machine that drives it.
//!
//! ## State Machine
//!
//! ```text
//!                    ┌──────────────────────┐
//!         TLS ┌─────►│ NegotiatingSecurity  │──── failure ───────────┐
//!             │      └──────────┬───────────┘                        │
//!   bind ─────┤                 │ handshake done                     │
//!             │                 ▼                                    │
//!      no TLS └─────►┌──────────────────────┐◄───────────┐           │
//!                    │   AwaitingRequest    │            │           │
//!                    └──────────┬───────────┘            │           │
//!                               │ readable               │           │
//!                               ▼                        │           │
//!                    ┌──────────────────────┐ partial    │           │
//!                    │       Reading        │◄──┐ frame  │           │
//!                    └──────────┬───────────┘───┘        │           │
//!                               │ complete frame         │           │
//!                               ▼                        │           │
//!                    ┌──────────────────────┐  queued  ┌─┴──────────────────┐
//!                    │ ParsingAndDispatching│─────────►│ AwaitingExecution  │
//!                    └──────────┬───────────┘          └─┬──────────────────┘
//!                               │ completed              │ work ready
//!                               ▼                        │
//!                    ┌──────────────────────┐◄───────────┘
//!                    │       Writing        │── flushed ──► AwaitingRequest
//!                    └──────────┬───────────┘
//!                               │ terminate / error
//!                               ▼
//!                    Closing ──► Closed (pooled)
//! ```
//!
//! A handle suspends only in `AwaitingRequest`, `Reading`, `Writing` and
//! `AwaitingExecution`, each time holding exactly the reactor registration
//! it waits for.

use std::io::{self, Read, Write};
use std::sync::{Arc, Weak};

use mio::event::Source;
use parking_lot::Mutex;
use rustls::ServerConnection;

use super::reactor::{EventKind, EventRef, Reactor};
use super::security::{self, Negotiation, SecurityState, TransportSecurity, SECURITY_ACCEPT};
use super::socket::{ConnectionId, Socket};
use super::stats::ConnectionStats;
use super::task::TaskShared;
use crate::buffer::Buffer;
use crate::error::{GateError, Result};
use crate::execution::{QueryExecutor, Submission};
use crate::protocol::{Command, ProtocolHandler, Response};

/// A handle shared between the factory's registry and its owning task
pub type SharedHandle = Arc<Mutex<ConnectionHandle>>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NegotiatingSecurity,
    AwaitingRequest,
    Reading,
    ParsingAndDispatching,
    AwaitingExecution,
    Writing,
    Closing,
    /// Closed and pooled for reuse
    Closed,
}

/// Why a handle is being driven.
///
/// Only the owning task drives a handle; see `ConnectionHandlerTask::inject`.
#[doc(hidden)]
#[derive(Debug)]
pub enum Wakeup {
    /// Readable registration fired
    Readable,
    /// Writable registration fired
    Writable,
    /// Queued execution finished
    WorkReady {
        epoch: u64,
        responses: Vec<Response>,
    },
    /// The task replays a handle that yielded with input still pending
    Resume,
}

/// Where a handle stopped after being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Waiting on a reactor registration
    Suspended,
    /// Has more buffered work; re-queue behind other ready handles
    Yielded,
    /// Closed and returned to the pool
    Closed,
}

enum Next {
    Continue,
    Suspend,
    Yield,
}

#[derive(Debug, Default)]
struct ReadOutcome {
    bytes: usize,
    eof: bool,
    /// Socket reported `WouldBlock`; no readiness edge will be missed
    drained: bool,
}

#[derive(Debug, Default)]
struct FlushOutcome {
    written: usize,
    complete: bool,
}

/// One client connection
pub struct ConnectionHandle {
    id: ConnectionId,
    state: ConnState,

    /// Bumped on every bind; completions from an older binding are dropped
    epoch: u64,

    socket: Option<Box<dyn Socket>>,
    receive_buffer: Buffer,
    send_buffer: Buffer,
    security: TransportSecurity,
    protocol: Box<dyn ProtocolHandler>,
    executor: Box<dyn QueryExecutor>,

    network_event: Option<EventRef>,
    work_event: Option<EventRef>,
    owner: Weak<TaskShared>,

    command: Option<Command>,
    responses: Vec<Response>,
    next_response: usize,
    close_after_write: bool,
    socket_drained: bool,

    stats: Arc<ConnectionStats>,
}

impl ConnectionHandle {
    /// Only the factory constructs handles
    pub(super) fn new(
        id: ConnectionId,
        buffer_capacity: usize,
        tls: Option<Arc<rustls::ServerConfig>>,
        protocol: Box<dyn ProtocolHandler>,
        executor: Box<dyn QueryExecutor>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            id,
            state: ConnState::Closed,
            epoch: 0,
            socket: None,
            receive_buffer: Buffer::new(buffer_capacity),
            send_buffer: Buffer::new(buffer_capacity),
            security: TransportSecurity::new(tls),
            protocol,
            executor,
            network_event: None,
            work_event: None,
            owner: Weak::new(),
            command: None,
            responses: Vec::new(),
            next_response: 0,
            close_after_write: false,
            socket_drained: true,
            stats,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Closed handles sit in the factory's pool
    pub fn is_pooled(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn security_state(&self) -> SecurityState {
        self.security.state()
    }

    pub fn handshake_completed(&self) -> bool {
        self.security.handshake_completed()
    }

    pub fn receive_buffer(&self) -> &Buffer {
        &self.receive_buffer
    }

    pub fn send_buffer(&self) -> &Buffer {
        &self.send_buffer
    }

    /// Index of the next response not yet encoded for the client
    pub fn next_response(&self) -> usize {
        self.next_response
    }

    pub fn network_event(&self) -> Option<EventRef> {
        self.network_event
    }

    pub fn work_event(&self) -> Option<EventRef> {
        self.work_event
    }

    /// Id of the task currently driving this handle, if it is still alive
    pub fn owner_task(&self) -> Option<usize> {
        self.owner.upgrade().map(|task| task.id())
    }

    // =========================================================================
    // Lifecycle (factory and task)
    // =========================================================================

    /// Attach a fresh connection and pin the handle to `task`
    pub(super) fn bind(&mut self, socket: Box<dyn Socket>, task: &Arc<TaskShared>) {
        self.epoch += 1;
        self.owner = Arc::downgrade(task);
        self.executor
            .set_completion_callback(task.completion_callback(self.id, self.epoch));
        self.socket = Some(socket);
        self.socket_drained = true;

        let initial = if self.security.is_configured() {
            ConnState::NegotiatingSecurity
        } else {
            ConnState::AwaitingRequest
        };
        self.transition(initial);
    }

    /// Make a pooled handle indistinguishable from a new one
    pub(super) fn reset(&mut self) {
        if self.network_event.is_some() || self.work_event.is_some() {
            tracing::warn!(
                connection = %self.id,
                "Pooled handle still holds registrations, removing them"
            );
            match self.owner.upgrade() {
                Some(previous) => self.clear_events(previous.reactor()),
                // The reactor died with its task
                None => {
                    self.network_event = None;
                    self.work_event = None;
                }
            }
        }
        if self.executor.is_queuing() {
            tracing::debug!(
                connection = %self.id,
                "Dropping in-flight execution of the previous connection"
            );
        }

        self.security.reset();
        self.receive_buffer.reset();
        self.send_buffer.reset();
        self.protocol.reset();
        self.executor.reset();
        self.command = None;
        self.responses.clear();
        self.next_response = 0;
        self.close_after_write = false;
        self.socket_drained = true;
    }

    /// Arm the first readable registration. Runs on the owning task.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.is_pooled() || self.socket.is_none() {
            return Err(GateError::InternalInvariant(format!(
                "{} started without a live connection",
                self.id
            )));
        }
        let task = self.owning_task()?;
        self.arm(task.reactor(), EventKind::Readable)
    }

    /// Force the connection closed regardless of its state
    pub(crate) fn close(&mut self) {
        if self.is_pooled() {
            return;
        }
        self.transition(ConnState::Closing);
        let task = self.owner.upgrade();
        self.finish_close(task.as_ref().map(|t| t.reactor()));
    }

    // =========================================================================
    // State Machine
    // =========================================================================

    /// Run the state machine until the next suspension point.
    ///
    /// Called by the owning handler task only. Connection-level failures
    /// close the connection and return `Ok(Step::Closed)`; an `Err` is always
    /// an internal invariant violation.
    pub(crate) fn drive(&mut self, wakeup: Wakeup) -> Result<Step> {
        let mut completion = None;
        match wakeup {
            Wakeup::Resume => {
                // Overtaken by a socket event in the same round
                if self.state != ConnState::AwaitingRequest {
                    return Ok(self.current_step());
                }
            }
            Wakeup::WorkReady { epoch, responses } => {
                if epoch != self.epoch {
                    tracing::debug!(
                        connection = %self.id,
                        "Dropping completion addressed to a previous connection"
                    );
                    return Ok(self.current_step());
                }
                if self.state != ConnState::AwaitingExecution {
                    return Err(self.violation("work completion"));
                }
                completion = Some(responses);
            }
            Wakeup::Readable | Wakeup::Writable => {
                if matches!(
                    self.state,
                    ConnState::Closing | ConnState::Closed | ConnState::AwaitingExecution
                ) {
                    return Err(self.violation("socket readiness"));
                }
            }
        }

        let task = self.owning_task()?;
        let reactor = task.reactor();

        loop {
            let next = match self.state {
                ConnState::NegotiatingSecurity => self.negotiate(reactor),
                ConnState::AwaitingRequest => {
                    self.transition(ConnState::Reading);
                    Ok(Next::Continue)
                }
                ConnState::Reading => self.read(reactor),
                ConnState::ParsingAndDispatching => self.dispatch(reactor),
                ConnState::AwaitingExecution => match completion.take() {
                    Some(responses) => self.complete(reactor, responses),
                    None => Ok(Next::Suspend),
                },
                ConnState::Writing => self.write(reactor),
                ConnState::Closing => {
                    self.finish_close(Some(reactor));
                    return Ok(Step::Closed);
                }
                ConnState::Closed => return Ok(Step::Closed),
            };

            match next {
                Ok(Next::Continue) => {}
                Ok(Next::Suspend) => return Ok(Step::Suspended),
                Ok(Next::Yield) => return Ok(Step::Yielded),
                Err(e) if e.is_invariant_violation() => {
                    self.finish_close(Some(reactor));
                    return Err(e);
                }
                Err(e) => {
                    self.log_close_reason(&e);
                    self.transition(ConnState::Closing);
                }
            }
        }
    }

    fn negotiate(&mut self, reactor: &Reactor) -> Result<Next> {
        if self.security.state() == SecurityState::NotNegotiated {
            let socket = self.socket.as_mut().ok_or_else(|| missing_socket(self.id))?;
            let outcome = fill_plain(socket, &mut self.receive_buffer)?;
            self.stats.bytes_read(outcome.bytes);

            match security::parse_request(self.receive_buffer.readable()) {
                Negotiation::Incomplete => {
                    if outcome.eof {
                        return Err(GateError::Handshake(
                            "peer closed before negotiating".to_string(),
                        ));
                    }
                    self.arm(reactor, EventKind::Readable)?;
                    return Ok(Next::Suspend);
                }
                Negotiation::Unsupported { version } => {
                    return Err(GateError::Handshake(format!(
                        "unsupported negotiation version {}",
                        version
                    )));
                }
                Negotiation::Malformed(reason) => return Err(GateError::Handshake(reason)),
                Negotiation::Request { len } => {
                    self.receive_buffer.consume(len);
                    // First bytes ever written to a fresh buffer
                    self.send_buffer.put_slice(&[SECURITY_ACCEPT]);

                    let session = self.security.begin()?;
                    // Anything after the request already belongs to the TLS handshake
                    let mut pipelined = 0;
                    while !self.receive_buffer.is_empty() {
                        match session.read_tls(&mut self.receive_buffer)? {
                            0 => break,
                            n => pipelined += n,
                        }
                    }
                    // The socket may already be drained, so no later read would
                    // hand these records to rustls
                    if pipelined > 0 {
                        session
                            .process_new_packets()
                            .map_err(|e| into_handshake_error(e.into()))?;
                    }
                    tracing::debug!(connection = %self.id, "Security request accepted");
                }
            }
        }

        if !self.send_buffer.is_empty() {
            let socket = self.socket.as_mut().ok_or_else(|| missing_socket(self.id))?;
            let flushed = flush_plain(socket, &mut self.send_buffer)?;
            self.stats.bytes_written(flushed.written);
            if !flushed.complete {
                self.arm(reactor, EventKind::Writable)?;
                return Ok(Next::Suspend);
            }
        }

        let socket = self.socket.as_mut().ok_or_else(|| missing_socket(self.id))?;
        let session = self.security.session().ok_or_else(|| {
            GateError::InternalInvariant(format!("{} negotiating without a TLS session", self.id))
        })?;
        let outcome =
            fill_tls(session, socket, &mut self.receive_buffer).map_err(into_handshake_error)?;
        let flushed = flush_tls(session, socket)?;
        let handshaking = session.is_handshaking();
        self.stats.bytes_read(outcome.bytes);
        self.stats.bytes_written(flushed.written);

        if handshaking {
            if outcome.eof {
                return Err(GateError::Handshake(
                    "peer closed during TLS handshake".to_string(),
                ));
            }
            let kind = if flushed.complete {
                EventKind::Readable
            } else {
                EventKind::Writable
            };
            self.arm(reactor, kind)?;
            return Ok(Next::Suspend);
        }
        if !flushed.complete {
            self.arm(reactor, EventKind::Writable)?;
            return Ok(Next::Suspend);
        }

        self.security.complete();
        tracing::debug!(connection = %self.id, "Transport security established");
        self.transition(ConnState::AwaitingRequest);
        Ok(Next::Continue)
    }

    fn read(&mut self, reactor: &Reactor) -> Result<Next> {
        let outcome = self.fill_receive_buffer()?;
        self.stats.bytes_read(outcome.bytes);
        self.socket_drained = outcome.drained;

        if let Some(command) = self.protocol.decode(&mut self.receive_buffer)? {
            self.command = Some(command);
            self.transition(ConnState::ParsingAndDispatching);
            return Ok(Next::Continue);
        }

        if outcome.eof {
            if self.receive_buffer.is_empty() {
                tracing::debug!("Client {} disconnected", self.id);
            } else {
                tracing::debug!(
                    "Client {} disconnected with {} bytes of an unfinished frame",
                    self.id,
                    self.receive_buffer.len()
                );
            }
            self.transition(ConnState::Closing);
            return Ok(Next::Continue);
        }

        if !outcome.drained {
            return Err(GateError::Protocol(
                "receive buffer full without a complete frame".to_string(),
            ));
        }

        if self.receive_buffer.is_empty() {
            self.transition(ConnState::AwaitingRequest);
        }
        self.arm(reactor, EventKind::Readable)?;
        Ok(Next::Suspend)
    }

    fn dispatch(&mut self, reactor: &Reactor) -> Result<Next> {
        let command = self.command.take().ok_or_else(|| {
            GateError::InternalInvariant(format!("{} dispatching without a command", self.id))
        })?;
        self.stats.command_processed();
        tracing::trace!(connection = %self.id, ?command, "Dispatching command");

        if command == Command::Terminate {
            tracing::debug!("Client {} requested termination", self.id);
            self.close_after_write = true;
            self.begin_response(Vec::new());
            return Ok(Next::Continue);
        }

        match self.executor.submit(command)? {
            Submission::Completed(responses) => {
                self.begin_response(responses);
                Ok(Next::Continue)
            }
            Submission::Queued => {
                // Nothing may wake this handle but the completion
                self.disarm_network(reactor);
                if let Some(stale) = self.work_event.take() {
                    reactor.unregister(stale, None);
                    return Err(self.violation("a second queued execution"));
                }
                self.work_event = Some(reactor.register(self.id, EventKind::WorkReady, None)?);
                self.transition(ConnState::AwaitingExecution);
                Ok(Next::Suspend)
            }
        }
    }

    fn complete(&mut self, reactor: &Reactor, responses: Vec<Response>) -> Result<Next> {
        let event = self.work_event.take().ok_or_else(|| {
            GateError::InternalInvariant(format!(
                "{} completed without a work registration",
                self.id
            ))
        })?;
        if !reactor.unregister(event, None) {
            return Err(self.violation("a completion for an unregistered work event"));
        }
        self.begin_response(responses);
        Ok(Next::Continue)
    }

    fn write(&mut self, reactor: &Reactor) -> Result<Next> {
        loop {
            while self.next_response < self.responses.len() {
                let response = &self.responses[self.next_response];
                if !self.protocol.encode(response, &mut self.send_buffer)? {
                    break;
                }
                self.next_response += 1;
            }

            if !self.flush_send_buffer()? {
                self.arm(reactor, EventKind::Writable)?;
                return Ok(Next::Suspend);
            }
            if self.next_response == self.responses.len() {
                break;
            }
        }
        self.responses.clear();
        self.next_response = 0;

        if self.close_after_write {
            self.transition(ConnState::Closing);
            return Ok(Next::Continue);
        }

        self.transition(ConnState::AwaitingRequest);
        self.arm(reactor, EventKind::Readable)?;
        if !self.receive_buffer.is_empty() || !self.socket_drained {
            Ok(Next::Yield)
        } else {
            Ok(Next::Suspend)
        }
    }

    fn begin_response(&mut self, responses: Vec<Response>) {
        self.responses = responses;
        self.next_response = 0;
        self.transition(ConnState::Writing);
    }

    fn finish_close(&mut self, reactor: Option<&Reactor>) {
        match reactor {
            Some(reactor) => self.clear_events(reactor),
            None => {
                self.network_event = None;
                self.work_event = None;
            }
        }

        if let Some(mut socket) = self.socket.take() {
            if let Some(session) = self.security.session() {
                session.send_close_notify();
                // Best effort: also carries a pending alert after a TLS error
                let _ = flush_tls(session, &mut socket);
            }
        }

        self.command = None;
        self.responses.clear();
        self.next_response = 0;
        self.close_after_write = false;
        self.transition(ConnState::Closed);
        self.stats.connection_closed();
        tracing::debug!(connection = %self.id, "Connection closed and pooled");
    }

    // =========================================================================
    // Registrations
    // =========================================================================

    /// Keep exactly one socket registration, of `kind`
    fn arm(&mut self, reactor: &Reactor, kind: EventKind) -> Result<()> {
        if let Some(event) = self.network_event {
            if reactor.kind_of(event) == Some(kind) {
                return Ok(());
            }
        }
        self.disarm_network(reactor);

        let socket = self.socket.as_mut().ok_or_else(|| missing_socket(self.id))?;
        let event = reactor.register(self.id, kind, Some(socket as &mut dyn Source))?;
        self.network_event = Some(event);
        Ok(())
    }

    fn disarm_network(&mut self, reactor: &Reactor) {
        if let Some(event) = self.network_event.take() {
            reactor.unregister(event, self.socket.as_mut().map(|s| s as &mut dyn Source));
        }
    }

    fn clear_events(&mut self, reactor: &Reactor) {
        self.disarm_network(reactor);
        if let Some(event) = self.work_event.take() {
            reactor.unregister(event, None);
        }
    }

    // =========================================================================
    // I/O
    // =========================================================================

    fn fill_receive_buffer(&mut self) -> Result<ReadOutcome> {
        let socket = self.socket.as_mut().ok_or_else(|| missing_socket(self.id))?;
        match self.security.session() {
            Some(session) => fill_tls(session, socket, &mut self.receive_buffer),
            None => Ok(fill_plain(socket, &mut self.receive_buffer)?),
        }
    }

    /// Returns true once everything encoded so far reached the socket
    fn flush_send_buffer(&mut self) -> Result<bool> {
        let socket = self.socket.as_mut().ok_or_else(|| missing_socket(self.id))?;
        let outcome = match self.security.session() {
            None => flush_plain(socket, &mut self.send_buffer)?,
            Some(session) => {
                let mut total = FlushOutcome::default();
                loop {
                    let accepted = if self.send_buffer.is_empty() {
                        0
                    } else {
                        let n = session.writer().write(self.send_buffer.readable())?;
                        self.send_buffer.consume(n);
                        n
                    };
                    let flushed = flush_tls(session, socket)?;
                    total.written += flushed.written;
                    if !flushed.complete || self.send_buffer.is_empty() {
                        total.complete = flushed.complete && self.send_buffer.is_empty();
                        break;
                    }
                    if accepted == 0 {
                        return Err(GateError::Io(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "TLS session accepted no plaintext",
                        )));
                    }
                }
                total
            }
        };
        self.stats.bytes_written(outcome.written);
        Ok(outcome.complete)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn owning_task(&self) -> Result<Arc<TaskShared>> {
        self.owner.upgrade().ok_or_else(|| {
            GateError::InternalInvariant(format!("{} has no live owning task", self.id))
        })
    }

    fn current_step(&self) -> Step {
        if self.is_pooled() {
            Step::Closed
        } else {
            Step::Suspended
        }
    }

    fn violation(&self, what: &str) -> GateError {
        tracing::error!(
            connection = %self.id,
            state = ?self.state,
            "Stale registration: {} delivered",
            what
        );
        GateError::InternalInvariant(format!(
            "{} delivered to {} in state {:?}",
            what, self.id, self.state
        ))
    }

    fn transition(&mut self, next: ConnState) {
        tracing::trace!(connection = %self.id, from = ?self.state, to = ?next, "Transition");
        self.state = next;
    }

    fn log_close_reason(&self, error: &GateError) {
        match error {
            GateError::Io(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                tracing::debug!("Client {} went away: {}", self.id, error);
            }
            _ => tracing::warn!("Closing {}: {}", self.id, error),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("security", &self.security.state())
            .field("network_event", &self.network_event)
            .field("work_event", &self.work_event)
            .field("next_response", &self.next_response)
            .finish()
    }
}

fn missing_socket(id: ConnectionId) -> GateError {
    GateError::InternalInvariant(format!("{} has no socket", id))
}

fn into_handshake_error(error: GateError) -> GateError {
    match error {
        GateError::Tls(e) => GateError::Handshake(e.to_string()),
        other => other,
    }
}

/// Read until the socket would block, hits EOF or the buffer is full
fn fill_plain(socket: &mut Box<dyn Socket>, buf: &mut Buffer) -> io::Result<ReadOutcome> {
    let mut outcome = ReadOutcome::default();
    loop {
        if buf.is_full() {
            return Ok(outcome);
        }
        match buf.fill_from(socket) {
            Ok(0) => {
                outcome.eof = true;
                return Ok(outcome);
            }
            Ok(n) => outcome.bytes += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                outcome.drained = true;
                return Ok(outcome);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Like [`fill_plain`] but through a TLS session; `bytes` counts ciphertext
fn fill_tls(
    session: &mut ServerConnection,
    socket: &mut Box<dyn Socket>,
    buf: &mut Buffer,
) -> Result<ReadOutcome> {
    let mut outcome = ReadOutcome::default();
    loop {
        // Hand over decrypted bytes first so rustls never stalls on its own buffer
        loop {
            if buf.is_full() {
                return Ok(outcome);
            }
            match session.reader().read(buf.writable()) {
                Ok(0) => {
                    outcome.eof = true;
                    return Ok(outcome);
                }
                Ok(n) => buf.commit(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Peer vanished without close_notify
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    outcome.eof = true;
                    return Ok(outcome);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match session.read_tls(socket) {
            Ok(0) => {
                outcome.eof = true;
                return Ok(outcome);
            }
            Ok(n) => {
                outcome.bytes += n;
                session.process_new_packets()?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                outcome.drained = true;
                return Ok(outcome);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write until the buffer is empty or the socket would block
fn flush_plain(socket: &mut Box<dyn Socket>, buf: &mut Buffer) -> io::Result<FlushOutcome> {
    let mut outcome = FlushOutcome::default();
    while !buf.is_empty() {
        match buf.drain_to(socket) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ))
            }
            Ok(n) => outcome.written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(outcome),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    outcome.complete = true;
    Ok(outcome)
}

/// Write pending TLS records until none are left or the socket would block
fn flush_tls(
    session: &mut ServerConnection,
    socket: &mut Box<dyn Socket>,
) -> io::Result<FlushOutcome> {
    let mut outcome = FlushOutcome::default();
    while session.wants_write() {
        match session.write_tls(socket) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ))
            }
            Ok(n) => outcome.written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(outcome),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    outcome.complete = true;
    Ok(outcome)
}
