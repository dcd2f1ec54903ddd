//! Per-transfer state machines, keyed by `(peer address, request id)`.
//!
//! - [`client`]: retransmission, deadlines and reassembly.
//! - [`server`]: request validation and chunked streaming.
//! - [`replay`]: the daemon's last-response cache.

pub mod client;
pub mod replay;
pub mod server;

pub use client::{ClientState, ClientTransfer};
pub use replay::ReplayCache;
pub use server::{ServerState, ServerTransfer};
