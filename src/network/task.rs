//! Connection handler task
//!
//! One thread per task, each with its own `mio::Poll` wrapped in a
//! [`Reactor`]. A task drives every connection pinned to it: socket
//! readiness comes from the poller, everything else (new connections, forced
//! closes, completed executions) arrives as a message on the task's channel
//! followed by a wake-up of the poller.
//!
//! ```text
//!   dispatcher ──Assign──┐
//!   workers ──Completed──┼──► channel ──► task thread ──► handle.drive()
//!   anyone ─────Close────┘        ▲            ▲
//!                               waker        poll (sockets)
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use mio::{Events, Poll, Token, Waker};

use super::handle::{SharedHandle, Step, Wakeup};
use super::reactor::{EventKind, Reactor, WAKER_TOKEN};
use super::socket::ConnectionId;
use crate::error::{GateError, Result};
use crate::execution::CompletionCallback;
use crate::protocol::Response;

enum TaskMessage {
    Assign(SharedHandle),
    Close { id: ConnectionId, epoch: u64 },
    Completed {
        id: ConnectionId,
        epoch: u64,
        responses: Vec<Response>,
    },
    Shutdown,
}

/// The part of a task other threads talk to
pub struct TaskShared {
    id: usize,
    reactor: Reactor,
    sender: Sender<TaskMessage>,
    waker: Waker,
}

impl TaskShared {
    pub fn id(&self) -> usize {
        self.id
    }

    /// The task's readiness registrations
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Hand a freshly bound handle to this task
    pub fn assign(&self, handle: SharedHandle) -> Result<()> {
        self.send(TaskMessage::Assign(handle))
    }

    /// Ask the task to force-close connection `id` as bound at `epoch`
    /// (cancellation). Ignored if the id has been rebound since.
    pub fn close(&self, id: ConnectionId, epoch: u64) -> Result<()> {
        self.send(TaskMessage::Close { id, epoch })
    }

    /// Ask the task to close all its connections and stop
    pub fn shutdown(&self) -> Result<()> {
        self.send(TaskMessage::Shutdown)
    }

    /// Callback for the executor of connection `id`, bound at `epoch`.
    ///
    /// Runs on a worker thread and only posts the responses back here.
    pub(crate) fn completion_callback(
        self: &Arc<Self>,
        id: ConnectionId,
        epoch: u64,
    ) -> CompletionCallback {
        let task = Arc::downgrade(self);
        Arc::new(move |responses: Vec<Response>| {
            let task = match task.upgrade() {
                Some(task) => task,
                None => return,
            };
            let message = TaskMessage::Completed {
                id,
                epoch,
                responses,
            };
            if let Err(e) = task.send(message) {
                tracing::debug!(connection = %id, "Completion not delivered: {}", e);
            }
        })
    }

    fn send(&self, message: TaskMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| GateError::Network(format!("handler task {} has stopped", self.id)))?;
        self.waker.wake()?;
        Ok(())
    }
}

impl std::fmt::Debug for TaskShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskShared")
            .field("id", &self.id)
            .field("reactor", &self.reactor)
            .finish()
    }
}

/// Event loop driving the connections pinned to it
pub struct ConnectionHandlerTask {
    shared: Arc<TaskShared>,
    poll: Poll,
    events: Events,
    receiver: Receiver<TaskMessage>,

    /// Connections this task owns, by id
    active: HashMap<ConnectionId, SharedHandle>,

    /// Connections that yielded with input still buffered
    ready: VecDeque<ConnectionId>,

    running: bool,
}

impl ConnectionHandlerTask {
    /// Create task `id` fetching up to `max_events` readiness events per poll
    pub fn new(id: usize, max_events: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let reactor = Reactor::new(poll.registry().try_clone()?);
        let (sender, receiver) = channel::unbounded();

        Ok(Self {
            shared: Arc::new(TaskShared {
                id,
                reactor,
                sender,
                waker,
            }),
            poll,
            events: Events::with_capacity(max_events.max(1)),
            receiver,
            active: HashMap::new(),
            ready: VecDeque::new(),
            running: false,
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Handle other threads use to reach this task
    pub fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    /// Number of connections currently owned
    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Run until shut down or an invariant violation.
    ///
    /// All owned connections are closed on the way out.
    pub fn run(&mut self, poll_timeout: Duration) -> Result<()> {
        self.running = true;
        tracing::info!("Handler task {} started", self.shared.id);

        let result = loop {
            if !self.running {
                break Ok(());
            }
            if let Err(e) = self.turn(Some(poll_timeout)) {
                break Err(e);
            }
        };

        self.running = false;
        self.close_all();
        match &result {
            Ok(()) => tracing::info!("Handler task {} stopped", self.shared.id),
            Err(e) => tracing::error!("Handler task {} aborted: {}", self.shared.id, e),
        }
        result
    }

    /// One round: poll, drive handles with socket events, apply messages,
    /// then give yielded handles one more step each.
    ///
    /// Returns how many times a handle was driven.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        // Handles waiting in the ready queue must not sit behind a blocking poll
        let timeout = if self.ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let fired: Vec<Token> = self
            .events
            .iter()
            .map(|event| event.token())
            .filter(|token| *token != WAKER_TOKEN)
            .collect();

        let mut driven = 0;
        for token in fired {
            // Removed earlier in this round; the event is stale
            let registration = match self.shared.reactor.resolve(token) {
                Some(registration) => registration,
                None => {
                    tracing::trace!(token = token.0, "Dropping event for removed registration");
                    continue;
                }
            };
            let wakeup = match registration.kind {
                EventKind::Readable => Wakeup::Readable,
                EventKind::Writable => Wakeup::Writable,
                EventKind::WorkReady => {
                    return Err(GateError::InternalInvariant(format!(
                        "poller fired work registration of {}",
                        registration.connection
                    )));
                }
            };
            self.drive(registration.connection, wakeup)?;
            driven += 1;
        }

        while let Ok(message) = self.receiver.try_recv() {
            match message {
                TaskMessage::Assign(handle) => self.adopt(handle)?,
                TaskMessage::Close { id, epoch } => self.close_connection(id, epoch),
                TaskMessage::Completed {
                    id,
                    epoch,
                    responses,
                } => {
                    if !self.active.contains_key(&id) {
                        tracing::debug!(connection = %id, "Dropping completion for a closed connection");
                        continue;
                    }
                    self.drive(id, Wakeup::WorkReady { epoch, responses })?;
                    driven += 1;
                }
                TaskMessage::Shutdown => {
                    tracing::debug!("Handler task {} received shutdown", self.shared.id);
                    self.running = false;
                }
            }
        }

        // Only those queued before this point; fresh yields wait a round
        for _ in 0..self.ready.len() {
            let id = match self.ready.pop_front() {
                Some(id) => id,
                None => break,
            };
            if !self.active.contains_key(&id) {
                continue;
            }
            self.drive(id, Wakeup::Resume)?;
            driven += 1;
        }

        Ok(driven)
    }

    /// Drive `handle` with `wakeup` on this task's thread, bypassing the
    /// poller and the channel. Lets connection tests replay stale events.
    #[doc(hidden)]
    pub fn inject(&mut self, handle: &SharedHandle, wakeup: Wakeup) -> Result<Step> {
        let mut guard = handle.lock();
        if guard.owner_task() != Some(self.shared.id) {
            return Err(GateError::InternalInvariant(format!(
                "{} injected into task {} but pinned to {:?}",
                guard.id(),
                self.shared.id,
                guard.owner_task()
            )));
        }
        guard.drive(wakeup)
    }

    fn drive(&mut self, id: ConnectionId, wakeup: Wakeup) -> Result<()> {
        let handle = match self.active.get(&id) {
            Some(handle) => Arc::clone(handle),
            None => {
                return Err(GateError::InternalInvariant(format!(
                    "live registration for {} not owned by task {}",
                    id, self.shared.id
                )));
            }
        };

        let step = handle.lock().drive(wakeup);
        match step {
            Ok(Step::Suspended) => {}
            Ok(Step::Yielded) => {
                if !self.ready.contains(&id) {
                    self.ready.push_back(id);
                }
            }
            Ok(Step::Closed) => {
                self.active.remove(&id);
            }
            Err(e) => {
                self.active.remove(&id);
                return Err(e);
            }
        }
        Ok(())
    }

    fn adopt(&mut self, handle: SharedHandle) -> Result<()> {
        let mut guard = handle.lock();
        let id = guard.id();

        if guard.owner_task() != Some(self.shared.id) {
            return Err(GateError::InternalInvariant(format!(
                "{} assigned to task {} but pinned to {:?}",
                id,
                self.shared.id,
                guard.owner_task()
            )));
        }
        match guard.start() {
            Ok(()) => {}
            Err(e) if e.is_invariant_violation() => return Err(e),
            Err(e) => {
                tracing::warn!("Cannot start {}: {}", id, e);
                guard.close();
                return Ok(());
            }
        }
        drop(guard);

        if self.active.insert(id, handle).is_some() {
            return Err(GateError::InternalInvariant(format!(
                "{} assigned twice to task {}",
                id, self.shared.id
            )));
        }
        tracing::debug!(connection = %id, task = self.shared.id, "Connection assigned");
        Ok(())
    }

    fn close_connection(&mut self, id: ConnectionId, epoch: u64) {
        let handle = match self.active.get(&id) {
            Some(handle) => Arc::clone(handle),
            None => {
                tracing::debug!(connection = %id, "Close requested for unknown connection");
                return;
            }
        };
        let mut guard = handle.lock();
        if guard.epoch() != epoch {
            tracing::debug!(
                connection = %id,
                epoch,
                current = guard.epoch(),
                "Dropping close addressed to a previous connection"
            );
            return;
        }
        guard.close();
        drop(guard);
        self.active.remove(&id);
        tracing::debug!(connection = %id, "Connection closed on request");
    }

    fn close_all(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.lock().close();
        }
        self.ready.clear();
    }
}

impl std::fmt::Debug for ConnectionHandlerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandlerTask")
            .field("id", &self.shared.id)
            .field("active", &self.active.len())
            .field("ready", &self.ready.len())
            .field("running", &self.running)
            .finish()
    }
}
