//! Per-stream state and the table that owns it.
//!
//! A record is created when a local client arrives on the Broker Socket or
//! when a `Connect` frame shows up on the inbound ring, and destroyed when
//! either the local socket dies or the peer sends `Disconnect`. Destruction
//! always goes through [`StreamTable::remove`], which keeps the teardown
//! order fixed: notify the peer (unless it initiated), shut the socket, drop
//! the entry, wake anyone waiting on the removal.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use conduit_ring::{Frame, FrameKind, RingFrame, RingWriter};
use tracing::debug;

use crate::socket::LocalSocket;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnectState {
    Pending,
    Confirmed,
    Closed,
}

pub struct StreamRecord {
    id: u32,
    socket: LocalSocket,
    connect_state: Mutex<ConnectState>,
    connect_cv: Condvar,
    /// Forwarding gate: the pump may not deliver peer frames to the socket
    /// until the locally-written `Confirm` is out, or the client would see
    /// data overtake its connect confirmation.
    ready: Mutex<bool>,
    ready_cv: Condvar,
    /// Set when teardown was caused by an inbound `Disconnect`, so the
    /// destructor side doesn't echo one back.
    peer_closed: AtomicBool,
    /// Serializes frame/payload writes so a forwarded payload can't
    /// interleave with a `Confirm` on the same socket.
    write_mu: spin::Mutex<()>,
}

impl StreamRecord {
    pub fn new(id: u32, socket: LocalSocket) -> Arc<Self> {
        Arc::new(Self {
            id,
            socket,
            connect_state: Mutex::new(ConnectState::Pending),
            connect_cv: Condvar::new(),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
            peer_closed: AtomicBool::new(false),
            write_mu: spin::Mutex::new(()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn socket(&self) -> &LocalSocket {
        &self.socket
    }

    pub fn mark_connected(&self) {
        let mut state = self.connect_state.lock().unwrap();
        if *state == ConnectState::Pending {
            *state = ConnectState::Confirmed;
        }
        self.connect_cv.notify_all();
    }

    /// Block until the peer confirms the connect. Returns false if the
    /// stream was torn down while waiting.
    pub fn wait_connected(&self) -> bool {
        let mut state = self.connect_state.lock().unwrap();
        while *state == ConnectState::Pending {
            state = self.connect_cv.wait(state).unwrap();
        }
        *state == ConnectState::Confirmed
    }

    /// Open the forwarding gate. Called on the initiating side once the
    /// local `Confirm` is written, and at creation time for streams the peer
    /// initiated (nothing to confirm locally there).
    pub fn mark_ready(&self) {
        *self.ready.lock().unwrap() = true;
        self.ready_cv.notify_all();
    }

    pub fn await_ready(&self) {
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            ready = self.ready_cv.wait(ready).unwrap();
        }
    }

    pub fn mark_peer_closed(&self) {
        self.peer_closed.store(true, Ordering::Release);
        self.mark_closed();
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }

    /// Wake every waiter; a torn-down stream must not park anyone.
    fn mark_closed(&self) {
        let mut state = self.connect_state.lock().unwrap();
        if *state == ConnectState::Pending {
            *state = ConnectState::Closed;
        }
        self.connect_cv.notify_all();
        drop(state);
        self.mark_ready();
    }

    pub fn write_frame(&self, frame: Frame) -> io::Result<()> {
        let _wg = self.write_mu.lock();
        self.socket.write_frame(frame)
    }

    pub fn write_payload(&self, bytes: &[u8]) -> io::Result<()> {
        let _wg = self.write_mu.lock();
        self.socket.write_all(bytes)
    }
}

pub struct StreamTable {
    streams: RwLock<HashMap<u32, Arc<StreamRecord>>>,
    removals: Mutex<()>,
    removal_cv: Condvar,
    next_id: AtomicU32,
}

impl StreamTable {
    /// Guest-initiated streams get odd ids, host-initiated even ones, so the
    /// two allocators never collide in the shared id space.
    pub fn new(is_guest: bool) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            removals: Mutex::new(()),
            removal_cv: Condvar::new(),
            next_id: AtomicU32::new(if is_guest { 1 } else { 2 }),
        }
    }

    pub fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(2, Ordering::Relaxed)
    }

    pub fn insert(&self, record: Arc<StreamRecord>) {
        let prev = self.streams.write().unwrap().insert(record.id(), record);
        conduit_utils::safe_assert!(prev.is_none(), "stream id reused while live");
    }

    pub fn get(&self, id: u32) -> Option<Arc<StreamRecord>> {
        self.streams.read().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.read().unwrap().contains_key(&id)
    }

    /// Tear a stream down. Safe to call from both the handler's error path
    /// and the pump's forwarding error path; the second caller finds the
    /// entry gone and returns.
    pub fn remove(&self, id: u32, ring: &RingWriter) {
        let Some(record) = self.streams.write().unwrap().remove(&id) else {
            return;
        };
        if !record.peer_closed() {
            ring.push(RingFrame::new(id, FrameKind::Disconnect, 0));
        }
        record.mark_closed();
        record.socket().shutdown();
        debug!(stream = id, peer_closed = record.peer_closed(), "stream removed");

        let _rg = self.removals.lock().unwrap();
        self.removal_cv.notify_all();
    }

    /// Block until `id` has left the table. Used by the inbound `Disconnect`
    /// path to keep teardown ordered before any further frame for that id.
    pub fn await_removed(&self, id: u32) {
        let mut guard = self.removals.lock().unwrap();
        while self.contains(id) {
            guard = self.removal_cv.wait(guard).unwrap();
        }
    }
}
