//! Process configuration, fixed at start-up.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_CLIENT_BUFFER_SIZE: u32 = 65_000;
pub const DEFAULT_REASSEMBLY_WINDOW: u32 = 4096;

pub const DEFAULT_SERVER_CHUNK: usize = 2048;
pub const DEFAULT_BURST: usize = 8;
pub const DEFAULT_REPLAY_LINGER: Duration = Duration::from_secs(30);

/// Retransmission parameters shared by every client transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// Largest chunk asked of the server.
    pub buffer_size: u32,
    /// How far past the delivered prefix a chunk may land and still be kept.
    pub reassembly_window: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            buffer_size: DEFAULT_CLIENT_BUFFER_SIZE,
            reassembly_window: DEFAULT_REASSEMBLY_WINDOW,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub root: PathBuf,
    /// Chunk size used when a request asks for buffer size 0.
    pub default_chunk: usize,
    /// Responses sent per streaming transfer on each loop turn.
    pub burst: usize,
    /// How long the last response of a finished transfer stays replayable.
    pub replay_linger: Duration,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, root: impl Into<PathBuf>) -> Self {
        Self {
            bind,
            root: root.into(),
            default_chunk: DEFAULT_SERVER_CHUNK,
            burst: DEFAULT_BURST,
            replay_linger: DEFAULT_REPLAY_LINGER,
        }
    }
}
