use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::events::{EventSink, StreamEvent};

/// Descriptor in the bridge's descriptor space. Sockets and process
/// streams share one space, as the interpreter sees a single fd table.
pub type Fd = u32;

pub type PeerId = u32;

/// Conditions a poll can wait for. `readable` covers urgent data too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollInterest {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl PollInterest {
    pub const READABLE: PollInterest = PollInterest {
        readable: true,
        writable: false,
        hangup: false,
        error: false,
    };

    pub const WRITABLE: PollInterest = PollInterest {
        readable: false,
        writable: true,
        hangup: false,
        error: false,
    };

    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.hangup || self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Open,
    Closed,
    Errored,
}

struct PeerEntry {
    state: PeerState,
    recv: VecDeque<Vec<u8>>,
    sink: EventSink,
}

struct SocketEntry {
    listening: bool,
    peers: Vec<PeerId>,
}

/// Snapshot of one peer taken under the table lock, used to evaluate poll
/// readiness and register listeners without holding the lock across an
/// await point.
pub struct PeerView {
    pub peer: PeerId,
    pub state: PeerState,
    pub has_data: bool,
    pub sink: EventSink,
}

/// Socket bookkeeping for one runtime instance: socket descriptors, their
/// peers, per-peer receive queues and event sinks. For a listening socket
/// the peers are its pending/accepted connections; polls consider all of
/// them.
#[derive(Default)]
pub struct SocketTable {
    inner: Mutex<SocketsInner>,
}

#[derive(Default)]
struct SocketsInner {
    next_peer: PeerId,
    sockets: HashMap<Fd, SocketEntry>,
    peers: HashMap<PeerId, PeerEntry>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SocketsInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register_socket(&self, fd: Fd, listening: bool) {
        let mut inner = self.lock();
        inner.sockets.insert(
            fd,
            SocketEntry {
                listening,
                peers: Vec::new(),
            },
        );
    }

    pub fn is_listening(&self, fd: Fd) -> bool {
        self.lock().sockets.get(&fd).is_some_and(|s| s.listening)
    }

    /// Attaches a new peer in the `Connecting` state. Returns `None` for
    /// an unknown socket.
    pub fn connect_peer(&self, fd: Fd) -> Option<PeerId> {
        let mut inner = self.lock();
        if !inner.sockets.contains_key(&fd) {
            return None;
        }
        let peer = inner.next_peer;
        inner.next_peer += 1;
        inner.peers.insert(
            peer,
            PeerEntry {
                state: PeerState::Connecting,
                recv: VecDeque::new(),
                sink: EventSink::new(),
            },
        );
        if let Some(socket) = inner.sockets.get_mut(&fd) {
            socket.peers.push(peer);
        }
        Some(peer)
    }

    pub fn open_peer(&self, peer: PeerId) {
        if let Some(sink) = self.set_state(peer, PeerState::Open) {
            sink.fire(StreamEvent::Connected);
        }
    }

    pub fn close_peer(&self, peer: PeerId) {
        if let Some(sink) = self.set_state(peer, PeerState::Closed) {
            sink.fire(StreamEvent::Closed);
        }
    }

    pub fn fail_peer(&self, peer: PeerId) {
        if let Some(sink) = self.set_state(peer, PeerState::Errored) {
            sink.fire(StreamEvent::ErrorRaised);
        }
    }

    fn set_state(&self, peer: PeerId, state: PeerState) -> Option<EventSink> {
        let mut inner = self.lock();
        let entry = inner.peers.get_mut(&peer)?;
        entry.state = state;
        Some(entry.sink.clone())
    }

    /// Queues inbound bytes on a peer and wakes readable-pollers.
    pub fn push_data(&self, peer: PeerId, data: Vec<u8>) {
        let sink = {
            let mut inner = self.lock();
            let Some(entry) = inner.peers.get_mut(&peer) else {
                return;
            };
            entry.recv.push_back(data);
            entry.sink.clone()
        };
        sink.fire(StreamEvent::DataReceived);
    }

    /// Pops the oldest queued chunk from a peer's receive queue.
    pub fn take_data(&self, peer: PeerId) -> Option<Vec<u8>> {
        self.lock().peers.get_mut(&peer)?.recv.pop_front()
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.lock().sockets.contains_key(&fd)
    }

    /// All peers backing `fd`, snapshotted for a poll pass.
    pub fn poll_view(&self, fd: Fd) -> Option<Vec<PeerView>> {
        let inner = self.lock();
        let socket = inner.sockets.get(&fd)?;
        let views = socket
            .peers
            .iter()
            .filter_map(|peer| {
                let entry = inner.peers.get(peer)?;
                Some(PeerView {
                    peer: *peer,
                    state: entry.state,
                    has_data: !entry.recv.is_empty(),
                    sink: entry.sink.clone(),
                })
            })
            .collect();
        Some(views)
    }

    /// Drops a socket and every peer attached to it.
    pub fn remove_socket(&self, fd: Fd) {
        let mut inner = self.lock();
        if let Some(socket) = inner.sockets.remove(&fd) {
            for peer in socket.peers {
                inner.peers.remove(&peer);
            }
        }
    }
}
