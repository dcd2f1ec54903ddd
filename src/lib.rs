//! `fftp`: a small file-retrieval protocol over a single UDP socket.
//!
//! ```text
//!   client                                    daemon
//!  ┌──────────────┐   INITIATE Request   ┌──────────────┐
//!  │ClientTransfer│─────────────────────▶│ServerTransfer│──▶ ServedRoot
//!  └──────┬───────┘                      └──────┬───────┘
//!         │   FIRST / CONNECTED Responses       │
//!         │◀────────────────────────────────────┘
//!  ┌──────▼───────┐
//!  │ TransferSink │  (listing or file)
//!  └──────────────┘
//! ```
//!
//! - [`protocol`]     constants, tags and frame flags
//! - [`frame`]        checksummed envelope around every datagram
//! - [`message`]      `Request` / `Response` payload layouts
//! - [`transfer`]     per-transfer state machines and the replay cache
//! - [`event_loop`]   the single-threaded socket driver
//! - [`resource`]     what the daemon serves
//! - [`sink`]         where the client puts what it receives
//! - [`config`], [`error`], [`shutdown_mgr`], [`stun`]

pub mod config;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod message;
pub mod protocol;
pub mod resource;
pub mod shutdown_mgr;
pub mod sink;
pub mod stun;
pub mod transfer;
