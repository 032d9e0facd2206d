//! Factory Tests
//!
//! These tests verify:
//! - One handle per connection id, reused after close
//! - Handing out an id that is still active is an invariant violation
//! - Reused handles come back fully reset and re-pinned to the new task
//! - Registry counters (len, active, pooled) and statistics
//! - Concurrent callers on distinct ids, and reuse racing a forced close

#[path = "../support/mod.rs"]
mod support;

use std::collections::HashSet;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sqlgate::network::{ConnState, ConnectionId, SecurityState};
use sqlgate::protocol::{encode_command, Command, Response};
use support::Harness;

// =============================================================================
// Helper Functions
// =============================================================================

fn fresh_socket() -> Box<mio::net::UnixStream> {
    let (server, _client) = StdUnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();
    Box::new(mio::net::UnixStream::from_std(server))
}

/// Server end for the factory plus the peer that keeps it open
fn socket_pair() -> (Box<mio::net::UnixStream>, StdUnixStream) {
    let (server, client) = StdUnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();
    (Box::new(mio::net::UnixStream::from_std(server)), client)
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_first_connection_allocates() {
    let mut h = Harness::new(1);
    let (handle, _client) = h.connect(5, 0);

    let guard = handle.lock();
    assert_eq!(guard.id(), ConnectionId(5));
    assert_eq!(guard.state(), ConnState::AwaitingRequest);
    assert_eq!(guard.security_state(), SecurityState::NotApplicable);
    assert_eq!(guard.epoch(), 1);
    assert_eq!(guard.owner_task(), Some(0));
    drop(guard);

    let stats = h.factory.stats();
    assert_eq!(stats.handles_allocated.load(Ordering::Relaxed), 1);
    assert_eq!(stats.handles_reused.load(Ordering::Relaxed), 0);
    assert_eq!(stats.active(), 1);
    assert_eq!(h.factory.len(), 1);
}

#[test]
fn test_lookup_returns_registered_handle() {
    let mut h = Harness::new(1);
    let (handle, _client) = h.connect(11, 0);

    let found = h.factory.lookup(ConnectionId(11)).unwrap();
    assert!(Arc::ptr_eq(&found, &handle));
    assert!(h.factory.lookup(ConnectionId(12)).is_none());
}

#[test]
fn test_distinct_ids_get_distinct_handles() {
    let mut h = Harness::new(1);
    let (a, _ca) = h.connect(5, 0);
    let (b, _cb) = h.connect(7, 0);

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(h.factory.len(), 2);
    assert_eq!(h.factory.active_count(), 2);
    assert_eq!(h.factory.pooled_count(), 0);
}

#[test]
fn test_active_id_is_invariant_violation() {
    let mut h = Harness::new(1);
    let (handle, _client) = h.connect(5, 0);

    let err = h
        .factory
        .get_or_create(ConnectionId(5), fresh_socket(), h.tasks[0].shared())
        .unwrap_err();
    assert!(err.is_invariant_violation());

    // Nothing was allocated and the active handle is untouched
    let stats = h.factory.stats();
    assert_eq!(stats.handles_allocated.load(Ordering::Relaxed), 1);
    assert_eq!(h.factory.len(), 1);
    assert!(Arc::ptr_eq(&h.factory.lookup(ConnectionId(5)).unwrap(), &handle));
    assert_eq!(handle.lock().epoch(), 1);
}

// =============================================================================
// Reuse Tests
// =============================================================================

#[test]
fn test_closed_handle_is_reused() {
    let mut h = Harness::new(1);
    let (first, client) = h.connect(5, 0);
    h.turn(0);

    drop(client);
    assert!(h.turn_until(0, || first.lock().is_pooled()));
    assert_eq!(h.factory.pooled_count(), 1);
    assert_eq!(h.factory.stats().active(), 0);

    let (second, _client) = h.connect(5, 0);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.lock().epoch(), 2);

    let stats = h.factory.stats();
    assert_eq!(stats.handles_allocated.load(Ordering::Relaxed), 1);
    assert_eq!(stats.handles_reused.load(Ordering::Relaxed), 1);
    assert_eq!(h.probe.resets.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reused_handle_is_reset() {
    let mut h = Harness::new(1);
    let (handle, mut client) = h.connect(5, 0);

    // Leave half a frame behind, then disappear
    let frame = encode_command(&Command::query("SELECT leftovers"));
    client.send_raw(&frame[..7]);
    assert!(h.turn_until(0, || handle.lock().receive_buffer().len() == 7));
    drop(client);
    assert!(h.turn_until(0, || handle.lock().is_pooled()));

    let (again, _client) = h.connect(5, 0);
    let guard = again.lock();
    assert_eq!(guard.state(), ConnState::AwaitingRequest);
    assert!(guard.receive_buffer().is_empty());
    assert!(guard.send_buffer().is_empty());
    assert_eq!(guard.next_response(), 0);
    assert!(guard.network_event().is_none());
    assert!(guard.work_event().is_none());
    assert!(!guard.handshake_completed());
}

#[test]
fn test_reuse_moves_registrations_to_new_task() {
    let mut h = Harness::new(2);
    let (handle, client) = h.connect(5, 0);
    assert!(h.turn_until(0, || handle.lock().network_event().is_some()));
    assert_eq!(h.tasks[0].shared().reactor().registrations_for(ConnectionId(5)), 1);

    drop(client);
    assert!(h.turn_until(0, || handle.lock().is_pooled()));
    assert_eq!(h.tasks[0].shared().reactor().registrations_for(ConnectionId(5)), 0);

    let (moved, mut client) = h.connect(5, 1);
    assert!(Arc::ptr_eq(&handle, &moved));
    assert_eq!(moved.lock().owner_task(), Some(1));

    assert!(h.turn_until(1, || moved.lock().network_event().is_some()));
    assert_eq!(h.tasks[1].shared().reactor().registrations_for(ConnectionId(5)), 1);
    assert_eq!(h.tasks[0].shared().reactor().registrations_for(ConnectionId(5)), 0);

    // And it serves traffic on the new task
    client.send(&Command::Ping);
    let reply = h.reply(1, &mut client);
    assert_eq!(reply, vec![Response::pong()]);
}

#[test]
fn test_tasks_track_active_connections() {
    let mut h = Harness::new(1);
    let (a, _ca) = h.connect(1, 0);
    let (_b, _cb) = h.connect(2, 0);
    h.turn(0);
    assert_eq!(h.tasks[0].active_connections(), 2);

    let epoch = a.lock().epoch();
    h.tasks[0].shared().close(ConnectionId(1), epoch).unwrap();
    assert!(h.turn_until(0, || a.lock().is_pooled()));
    assert_eq!(h.tasks[0].active_connections(), 1);
    assert_eq!(h.factory.active_count(), 1);
    assert_eq!(h.factory.pooled_count(), 1);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_get_or_create_distinct_ids() {
    let h = Harness::new(1);
    let threads: i32 = 8;
    let per_thread: i32 = 25;
    let total = (threads * per_thread) as usize;

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let factory = Arc::clone(&h.factory);
            let task = Arc::clone(h.tasks[0].shared());
            thread::spawn(move || {
                (0..per_thread)
                    .map(|i| {
                        let id = ConnectionId(1000 + t * per_thread + i);
                        let (socket, peer) = socket_pair();
                        let handle = factory.get_or_create(id, socket, &task).unwrap();
                        (id, handle, peer)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut created = Vec::new();
    for worker in workers {
        created.extend(worker.join().unwrap());
    }

    assert_eq!(created.len(), total);
    assert_eq!(h.factory.len(), total);
    assert_eq!(h.factory.active_count(), total);
    assert_eq!(h.factory.pooled_count(), 0);

    let stats = h.factory.stats();
    assert_eq!(stats.handles_allocated.load(Ordering::Relaxed), total as u64);
    assert_eq!(stats.handles_reused.load(Ordering::Relaxed), 0);

    let distinct: HashSet<usize> = created
        .iter()
        .map(|(_, handle, _)| Arc::as_ptr(handle) as usize)
        .collect();
    assert_eq!(distinct.len(), total);

    for (id, handle, _) in &created {
        assert!(Arc::ptr_eq(&h.factory.lookup(*id).unwrap(), handle));
        let guard = handle.lock();
        assert_eq!(guard.id(), *id);
        assert_eq!(guard.epoch(), 1);
    }
}

#[test]
fn test_get_or_create_racing_close_is_serialized() {
    let mut h = Harness::new(1);
    let rounds = 20;
    let (first, _client) = h.connect(5, 0);
    let mut peers: Vec<StdUnixStream> = Vec::new();

    // The task runs on its own thread so the close lands concurrently
    let mut task = h.tasks.remove(0);
    let shared = Arc::clone(task.shared());
    let runner = thread::spawn(move || task.run(Duration::from_millis(2)));

    let mut epoch = 1;
    for _ in 0..rounds {
        let closer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.close(ConnectionId(5), epoch).unwrap())
        };
        let (socket, peer) = socket_pair();
        let result = h.factory.get_or_create(ConnectionId(5), socket, &shared);
        closer.join().unwrap();

        match result {
            Ok(handle) => {
                // Won after the close: a complete reset, never a half-reset handle
                assert!(Arc::ptr_eq(&handle, &first));
                let guard = handle.lock();
                assert_eq!(guard.epoch(), epoch + 1);
                assert_eq!(guard.state(), ConnState::AwaitingRequest);
                assert!(guard.receive_buffer().is_empty());
                assert!(guard.send_buffer().is_empty());
                assert!(guard.network_event().is_none());
                assert!(guard.work_event().is_none());
                assert_eq!(guard.owner_task(), Some(0));
            }
            Err(e) => {
                // Ran before the close; the close still lands
                assert!(e.is_invariant_violation());
                assert!(wait_until(|| first.lock().is_pooled()));
                let (socket, retry) = socket_pair();
                h.factory
                    .get_or_create(ConnectionId(5), socket, &shared)
                    .unwrap();
                assert_eq!(first.lock().epoch(), epoch + 1);
                peers.push(retry);
            }
        }
        peers.push(peer);
        shared.assign(Arc::clone(&first)).unwrap();
        epoch += 1;
    }

    shared.shutdown().unwrap();
    runner.join().unwrap().unwrap();

    assert!(first.lock().is_pooled());
    assert_eq!(h.factory.len(), 1);
    let stats = h.factory.stats();
    assert_eq!(stats.handles_allocated.load(Ordering::Relaxed), 1);
    assert_eq!(stats.handles_reused.load(Ordering::Relaxed), rounds as u64);
    assert_eq!(stats.active(), 0);
}
