//! Daemon side of one transfer: validation and chunked streaming.
//!
//! ```text
//!  Accepted ──first response──▶ Streaming ──TERM──▶ Done
//!      │                            │
//!      └───────────ERR──────────────┴─────────────▶ Aborted
//! ```
//!
//! A transfer is pulled one response at a time with
//! [`ServerTransfer::next_response`]; the event loop decides how many to pull
//! per turn and owns the socket.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};

use crate::error::TransferError;
use crate::message::{Request, Response};
use crate::protocol::{RequestTag, ResponseTag, MAX_CHUNK_SIZE};
use crate::resource::{Entries, FileHandle, ServedRoot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Accepted,
    Streaming,
    Done,
    Aborted,
}

enum Cursor {
    Entries(Entries),
    File { handle: Box<dyn FileHandle>, offset: u64 },
    Refused(TransferError),
    Closed,
}

pub struct ServerTransfer {
    peer: SocketAddr,
    request: Request,
    state: ServerState,
    cursor: Cursor,
    next_sequence: u32,
    chunk_size: usize,
}

impl ServerTransfer {
    /// Validate `request` and open the resource it names.
    ///
    /// A refused request still yields a transfer; its only response is the `ERR`.
    pub fn accept<R: ServedRoot + ?Sized>(
        peer: SocketAddr,
        request: Request,
        root: &R,
        default_chunk: usize,
    ) -> Self {
        let chunk_size = chunk_size_for(request.requested_buffer_size, default_chunk);
        let cursor = match open(&request, root) {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!("{peer} request {} for {:?} refused: {e}", request.request_id, request.path);
                Cursor::Refused(e)
            }
        };
        debug!(
            "{peer} request {} accepted: {:?} {:?}, chunk size {chunk_size}",
            request.request_id, request.tag, request.path
        );
        Self {
            peer,
            request,
            state: ServerState::Accepted,
            cursor,
            next_sequence: 0,
            chunk_size,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ServerState::Done | ServerState::Aborted)
    }

    /// The next response to send, or `None` once the transfer has ended.
    pub fn next_response(&mut self) -> Option<Response> {
        if self.is_finished() {
            return None;
        }

        let sequence = self.next_sequence;
        let response = match std::mem::replace(&mut self.cursor, Cursor::Closed) {
            Cursor::Refused(e) => Response::error(sequence, &e.to_string()),
            Cursor::Closed => return None,
            Cursor::Entries(mut entries) => {
                let response = match self.request.tag {
                    RequestTag::Entry => Response::new(ResponseTag::Term, sequence, page(&mut entries, self.chunk_size)),
                    // A name longer than the chunk size still goes out whole.
                    _ => match entries.next() {
                        Some(name) => Response::new(ResponseTag::LsEntry, sequence, name.into_bytes()),
                        None => Response::new(ResponseTag::Term, sequence, Vec::new()),
                    },
                };
                self.cursor = Cursor::Entries(entries);
                response
            }
            Cursor::File { mut handle, offset } => match handle.read_at(offset, self.chunk_size) {
                Err(e) => {
                    warn!("{} read of {:?} failed: {e}", self.peer, self.request.path);
                    Response::error(sequence, &TransferError::from(e).to_string())
                }
                Ok(data) => {
                    let last = self.request.tag == RequestTag::Chunk || data.len() < self.chunk_size;
                    let tag = if last { ResponseTag::Term } else { ResponseTag::Chunk };
                    self.cursor = Cursor::File {
                        handle,
                        offset: offset + data.len() as u64,
                    };
                    Response::new(tag, sequence, data)
                }
            },
        };

        let response = match self.next_sequence.checked_add(1) {
            Some(next) => {
                self.next_sequence = next;
                response
            }
            // The last sequence number can only close the transfer.
            None if response.is_terminal() => response,
            None => {
                warn!("{} request {} ran out of sequence numbers", self.peer, self.request.request_id);
                Response::error(sequence, &TransferError::TooManyChunks.to_string())
            }
        };
        self.state = match response.tag {
            ResponseTag::Term => ServerState::Done,
            ResponseTag::Err => ServerState::Aborted,
            _ => ServerState::Streaming,
        };
        if self.is_finished() {
            // Release the directory iterator or file handle now.
            self.cursor = Cursor::Closed;
            debug!(
                "{} request {} finished as {:?} after {} responses",
                self.peer, self.request.request_id, self.state, self.next_sequence
            );
        }
        Some(response)
    }
}

fn open<R: ServedRoot + ?Sized>(request: &Request, root: &R) -> Result<Cursor, TransferError> {
    let path = normalize(&request.path)?;
    if request.tag.is_directory_op() {
        return Ok(Cursor::Entries(root.list_entries(&path)?));
    }
    if path.as_os_str().is_empty() {
        return Err(TransferError::NotAFile);
    }
    Ok(Cursor::File {
        handle: root.open_for_read(&path)?,
        offset: 0,
    })
}

/// Resolve a request path lexically against the served root.
///
/// The result is relative to the root; `..` may never climb above it.
pub fn normalize(path: &str) -> Result<PathBuf, TransferError> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(TransferError::PathOutsideRoot);
                }
            }
            Component::Prefix(_) => return Err(TransferError::PathOutsideRoot),
        }
    }
    Ok(out)
}

/// Zero asks for the daemon's default.
pub fn chunk_size_for(requested: u32, default_chunk: usize) -> usize {
    let wanted = match requested {
        0 => default_chunk,
        n => n as usize,
    };
    wanted.clamp(1, MAX_CHUNK_SIZE)
}

// Newline separated names, as many as fit, never fewer than one. Like an
// LS_ENTRY, a first name longer than `limit` is sent whole, so a page may
// exceed the chunk size but never the frame.
fn page(entries: &mut Entries, limit: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for name in entries.by_ref() {
        let needed = if out.is_empty() { name.len() } else { name.len() + 1 };
        if !out.is_empty() && out.len() + needed > limit {
            break;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(name.as_bytes());
    }
    out
}
