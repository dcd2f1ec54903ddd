//! Last-response cache for finished daemon transfers.
//!
//! A client that lost the final response resends its request. Instead of
//! restarting the stream, the daemon answers from here with the one datagram
//! it sent last. Entries expire after a fixed linger time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::message::Request;

struct Replay {
    request: Request,
    datagram: Vec<u8>,
    expires: Instant,
}

pub struct ReplayCache {
    linger: Duration,
    entries: HashMap<(SocketAddr, u8), Replay>,
}

impl ReplayCache {
    pub fn new(linger: Duration) -> Self {
        Self {
            linger,
            entries: HashMap::new(),
        }
    }

    pub fn remember(&mut self, peer: SocketAddr, request: Request, datagram: Vec<u8>, now: Instant) {
        let key = (peer, request.request_id);
        self.entries.insert(
            key,
            Replay {
                request,
                datagram,
                expires: now + self.linger,
            },
        );
    }

    /// The cached datagram, if `request` is identical to the one that produced it.
    pub fn replay(&self, peer: SocketAddr, request: &Request, now: Instant) -> Option<&[u8]> {
        self.entries
            .get(&(peer, request.request_id))
            .filter(|entry| entry.request == *request && now < entry.expires)
            .map(|entry| entry.datagram.as_slice())
    }

    pub fn forget(&mut self, peer: SocketAddr, request_id: u8) {
        self.entries.remove(&(peer, request_id));
    }

    /// Drop expired entries; returns how many went.
    pub fn purge(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires);
        before - self.entries.len()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.expires).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
