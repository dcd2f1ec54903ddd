//! Client side of one transfer: retransmission and reassembly.
//!
//! ```text
//!  Requesting ──first response──▶ Receiving ──TERM, no gaps──▶ Complete
//!      │                              │
//!      └──────ERR / retries spent─────┴──────────────────────▶ Failed
//! ```
//!
//! The server drives emission, so every accepted response pushes the deadline
//! out again. When the deadline passes the identical request datagram is
//! resent; a daemon that already finished replays its last response, which
//! recovers a lost `TERM`.
//!
//! This module only manages state. All socket I/O is the caller's job.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::config::{ClientConfig, RetryPolicy};
use crate::error::{TransferError, WireError};
use crate::message::{Request, Response};
use crate::protocol::ResponseTag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Requesting,
    Receiving,
    Complete,
    Failed(TransferError),
}

#[derive(Debug)]
pub struct ClientTransfer {
    peer: SocketAddr,
    request: Request,
    datagram: Vec<u8>,
    policy: RetryPolicy,
    window: u32,
    state: ClientState,
    deadline: Option<Instant>,
    retries: u32,
    /// Received chunks not yet handed to the application, by sequence.
    pending: BTreeMap<u32, Vec<u8>>,
    /// Next sequence the application will be given.
    delivered: u32,
    /// Every sequence below this one has been received.
    contiguous: u32,
    term: Option<u32>,
}

impl ClientTransfer {
    /// Prepare `request` for `peer`. The caller sends [`Self::datagram`] right away.
    pub fn new(
        peer: SocketAddr,
        request: Request,
        config: &ClientConfig,
        now: Instant,
    ) -> Result<Self, WireError> {
        let datagram = request.to_datagram()?;
        Ok(Self {
            peer,
            request,
            datagram,
            policy: config.retry,
            window: config.reassembly_window.max(1),
            state: ClientState::Requesting,
            deadline: Some(now + config.retry.timeout),
            retries: 0,
            pending: BTreeMap::new(),
            delivered: 0,
            contiguous: 0,
            term: None,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn datagram(&self) -> &[u8] {
        &self.datagram
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ClientState::Complete | ClientState::Failed(_))
    }

    /// Handle the deadline passing.
    ///
    /// Returns the datagram to resend, or `None` if the deadline is not due or
    /// the retry budget is spent (the transfer is then `Failed(Timeout)`).
    pub fn on_deadline(&mut self, now: Instant) -> Option<Vec<u8>> {
        let deadline = self.deadline?;
        if now < deadline || self.is_finished() {
            return None;
        }

        if self.retries >= self.policy.max_retries {
            warn!(
                "request {} for {:?} timed out after {} retries",
                self.request.request_id, self.request.path, self.retries
            );
            self.fail(TransferError::Timeout);
            return None;
        }

        self.retries += 1;
        self.deadline = Some(now + self.policy.timeout);
        debug!(
            "resending request {} (attempt {}/{})",
            self.request.request_id, self.retries, self.policy.max_retries
        );
        Some(self.datagram.clone())
    }

    pub fn on_response(&mut self, response: Response, now: Instant) {
        if self.is_finished() {
            return;
        }

        let sequence = response.sequence;
        match response.tag {
            ResponseTag::Err => {
                let message = String::from_utf8_lossy(&response.data).into_owned();
                debug!("request {} refused: {message}", self.request.request_id);
                self.fail(TransferError::ServerError(message));
                return;
            }
            ResponseTag::Term => match self.term {
                Some(term) if term != sequence => {
                    warn!("conflicting TERM {sequence} after TERM {term}, ignored");
                    return;
                }
                _ => {
                    self.term = Some(sequence);
                    // Nothing may follow TERM.
                    self.pending.retain(|&seq, _| seq <= sequence);
                }
            },
            ResponseTag::LsEntry | ResponseTag::Chunk => {
                if matches!(self.term, Some(term) if sequence >= term) {
                    debug!("chunk {sequence} at or past TERM, ignored");
                    return;
                }
            }
        }

        if self.state == ClientState::Requesting {
            self.state = ClientState::Receiving;
        }
        self.deadline = Some(now + self.policy.timeout);

        if sequence < self.delivered {
            trace!("chunk {sequence} already delivered");
        } else if sequence - self.delivered >= self.window {
            debug!("chunk {sequence} outside reassembly window, dropped");
        } else if self.pending.insert(sequence, response.data).is_none() {
            trace!("chunk {sequence} stored");
            self.retries = 0;
            while self.contiguous < u32::MAX && self.pending.contains_key(&self.contiguous) {
                self.contiguous += 1;
            }
        }

        if matches!(self.term, Some(term) if self.contiguous > term) {
            self.state = ClientState::Complete;
            self.deadline = None;
        }
    }

    /// Hand over every chunk that is now contiguous with what was already taken.
    pub fn take_ready(&mut self) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        while self.delivered < self.contiguous {
            if let Some(chunk) = self.pending.remove(&self.delivered) {
                ready.push(chunk);
            }
            self.delivered += 1;
        }
        ready
    }

    /// End the transfer from the application side, e.g. when its output fails.
    pub fn abort(&mut self, error: TransferError) {
        if !self.is_finished() {
            self.fail(error);
        }
    }

    fn fail(&mut self, error: TransferError) {
        self.state = ClientState::Failed(error);
        self.deadline = None;
        self.pending.clear();
    }
}
