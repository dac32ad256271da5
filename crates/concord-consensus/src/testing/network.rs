//! In-process transport.

use crate::collaborators::PeerTransport;
use crate::message::MessageKind;
use bytes::Bytes;
use concord_types::{quorum, PeerIndex, Timestamp};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A message queued between two local peers.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sender.
    pub from: PeerIndex,
    /// Recipient.
    pub to: PeerIndex,
    /// Message kind.
    pub kind: MessageKind,
    /// Encoded payload.
    pub payload: Bytes,
}

/// A FIFO message queue shared by every peer of a local committee.
///
/// Messages from or to a peer marked dead are dropped on send.
#[derive(Debug)]
pub struct LocalNetwork {
    size: u16,
    alive: Vec<AtomicBool>,
    queue: Mutex<VecDeque<Envelope>>,
    sent: AtomicUsize,
    dropped: AtomicUsize,
}

impl LocalNetwork {
    /// Creates a network of `size` live peers.
    pub fn new(size: u16) -> Arc<Self> {
        Arc::new(Self {
            size,
            alive: (0..size).map(|_| AtomicBool::new(true)).collect(),
            queue: Mutex::new(VecDeque::new()),
            sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        })
    }

    /// Transport handle for `own`.
    pub fn transport(self: &Arc<Self>, own: PeerIndex) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            own,
        }
    }

    /// Marks `peer` alive or dead.
    pub fn set_alive(&self, peer: PeerIndex, alive: bool) {
        if let Some(flag) = self.alive.get(usize::from(peer)) {
            flag.store(alive, Ordering::SeqCst);
        }
    }

    /// Whether `peer` is alive.
    pub fn is_alive(&self, peer: PeerIndex) -> bool {
        self.alive
            .get(usize::from(peer))
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Number of live peers.
    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|f| f.load(Ordering::SeqCst)).count()
    }

    /// Committee size.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Removes and returns every queued message.
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }

    /// Messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Messages accepted for delivery so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Messages dropped because an endpoint was dead.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn push(&self, envelope: Envelope) {
        if !self.is_alive(envelope.from) || !self.is_alive(envelope.to) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push_back(envelope);
    }
}

/// One peer's view of a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    own: PeerIndex,
}

impl PeerTransport for LocalTransport {
    fn send_to(&self, peer: PeerIndex, kind: MessageKind, payload: Bytes) {
        if peer == self.own || peer >= self.network.size {
            return;
        }
        self.network.push(Envelope {
            from: self.own,
            to: peer,
            kind,
            payload,
        });
    }

    fn broadcast(&self, kind: MessageKind, payload: Bytes, _timestamp: Timestamp) {
        for peer in (0..self.network.size).filter(|p| *p != self.own) {
            self.network.push(Envelope {
                from: self.own,
                to: peer,
                kind,
                payload: payload.clone(),
            });
        }
    }

    fn is_alive(&self, peer: PeerIndex) -> bool {
        self.network.is_alive(peer)
    }

    fn quorum_alive(&self) -> bool {
        self.network.alive_count() >= quorum::quorum(usize::from(self.network.size))
    }
}
