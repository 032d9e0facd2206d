//! Connection dispatcher
//!
//! Accepts TCP connections and pins each to a handler task, round-robin.
//! The dispatcher never touches a connection again after assigning it.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::factory::ConnectionHandleFactory;
use super::socket::ConnectionId;
use super::task::TaskShared;
use crate::error::{GateError, Result};

const WAKER: Token = Token(0);
const LISTENER: Token = Token(1);

/// Stops a running dispatcher from any thread
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::warn!("Failed to wake dispatcher: {}", e);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Listening socket plus the tasks it feeds
pub struct Dispatcher {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    factory: Arc<ConnectionHandleFactory>,
    tasks: Vec<Arc<TaskShared>>,
    next_task: usize,
    max_connections: usize,
    shutdown: ShutdownHandle,
}

impl Dispatcher {
    /// Bind `addr` and prepare to feed `tasks`
    pub fn bind(
        addr: SocketAddr,
        factory: Arc<ConnectionHandleFactory>,
        tasks: Vec<Arc<TaskShared>>,
        max_connections: usize,
    ) -> Result<Self> {
        if tasks.is_empty() {
            return Err(GateError::Config(
                "dispatcher needs at least one handler task".to_string(),
            ));
        }

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(64),
            factory,
            tasks,
            next_task: 0,
            max_connections,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker,
            },
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn tasks(&self) -> &[Arc<TaskShared>] {
        &self.tasks
    }

    /// Accept connections until shut down
    pub fn run(&mut self, poll_timeout: Duration) -> Result<()> {
        tracing::info!("Accepting connections on {}", self.local_addr()?);

        while !self.shutdown.is_shutdown() {
            match self.poll.poll(&mut self.events, Some(poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let acceptable = self.events.iter().any(|event| event.token() == LISTENER);
            if acceptable {
                self.accept_all();
            }
        }

        tracing::info!("Dispatcher stopped");
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        let stats = self.factory.stats();
        if stats.active() >= self.max_connections as u64 {
            stats.connection_rejected();
            tracing::warn!(
                "Rejecting {}: connection limit of {} reached",
                peer,
                self.max_connections
            );
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let id = ConnectionId::from(stream.as_raw_fd());
        let task = Arc::clone(&self.tasks[self.next_task % self.tasks.len()]);
        self.next_task = self.next_task.wrapping_add(1);

        let handle = match self.factory.get_or_create(id, Box::new(stream), &task) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Cannot take connection from {}: {}", peer, e);
                return;
            }
        };
        tracing::debug!(connection = %id, task = task.id(), "Accepted {}", peer);

        if let Err(e) = task.assign(Arc::clone(&handle)) {
            tracing::error!(connection = %id, "Assignment failed: {}", e);
            handle.lock().close();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listener", &self.listener)
            .field("tasks", &self.tasks.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
