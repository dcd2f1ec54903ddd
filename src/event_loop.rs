//! The single-threaded driver that owns the UDP socket.
//!
//! Each turn waits for exactly one thing: a readable datagram, the nearest
//! deadline, the shutdown signal or (on the daemon, while something is
//! streaming) nothing at all. Everything after the wait runs to completion
//! before the next one, so no two frames are ever handled at once.
//!
//! Protocol decisions live in [`crate::transfer`]; this module only decodes,
//! routes, and writes the bytes the transfers hand it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::time::sleep_until;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{FatalError, TransferError};
use crate::frame::Frame;
use crate::message::{Request, Response};
use crate::protocol::{frame_type, MAX_FRAME_SIZE};
use crate::resource::ServedRoot;
use crate::shutdown_mgr::ShutdownManager;
use crate::sink::TransferSink;
use crate::transfer::{ClientState, ClientTransfer, ReplayCache, ServerTransfer};

type TransferKey = (SocketAddr, u8);

enum Event {
    Datagram(io::Result<(usize, SocketAddr)>),
    Deadline,
    Pump,
    Shutdown,
}

pub struct EventLoop {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buf: Vec<u8>,
    shutdown: ShutdownManager,
}

impl EventLoop {
    pub async fn bind(addr: SocketAddr, shutdown: ShutdownManager) -> Result<Self, FatalError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| FatalError::Bind { addr, source })?;
        Self::from_socket(socket, shutdown)
    }

    /// Bind an ephemeral port in the same address family as `peer`.
    ///
    /// Clients take a fresh one per transfer: responses carry no request id,
    /// so late datagrams of an earlier transfer must land on a closed port.
    pub async fn ephemeral_for(peer: SocketAddr, shutdown: ShutdownManager) -> Result<Self, FatalError> {
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        Self::bind(local, shutdown).await
    }

    pub fn from_socket(socket: UdpSocket, shutdown: ShutdownManager) -> Result<Self, FatalError> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            // One datagram more than the largest legal frame, so oversize ones show up as such.
            recv_buf: vec![0u8; MAX_FRAME_SIZE + 1],
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    async fn wait(&mut self, busy: bool, wake: Option<Instant>) -> Event {
        let sleep = sleep_until(tokio::time::Instant::from_std(
            wake.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
        ));

        tokio::select! {
            biased;
            _ = self.shutdown.recv() => Event::Shutdown,
            received = self.socket.recv_from(&mut self.recv_buf) => Event::Datagram(received),
            _ = std::future::ready(()), if busy => Event::Pump,
            _ = sleep, if wake.is_some() => Event::Deadline,
        }
    }

    async fn send(&self, datagram: &[u8], peer: SocketAddr) {
        if let Err(e) = self.socket.send_to(datagram, peer).await {
            warn!("send of {} bytes to {peer} failed: {e}", datagram.len());
        }
    }

    // Corrupt, truncated and wrong-role datagrams all end here.
    fn decode_frame(&self, len: usize, peer: SocketAddr, role: u8) -> Option<Frame> {
        match Frame::decode(&self.recv_buf[..len]) {
            Ok(frame) if frame.frame_type & role != 0 => Some(frame),
            Ok(frame) => {
                debug!("dropping frame type {:#04x} from {peer}", frame.frame_type);
                None
            }
            Err(e) => {
                warn!("dropping {len} byte datagram from {peer}: {e}");
                None
            }
        }
    }

    /// Serve `root` until the shutdown signal fires.
    pub async fn serve<R: ServedRoot + ?Sized>(
        &mut self,
        root: &R,
        config: &ServerConfig,
    ) -> Result<(), FatalError> {
        let mut transfers: HashMap<TransferKey, ServerTransfer> = HashMap::new();
        let mut replay = ReplayCache::new(config.replay_linger);
        info!("serving {} on {}", config.root.display(), self.local_addr);

        loop {
            let event = self.wait(!transfers.is_empty(), replay.next_expiry()).await;
            let now = Instant::now();
            match event {
                Event::Shutdown => {
                    info!("stopping with {} transfers in flight", transfers.len());
                    return Ok(());
                }
                Event::Datagram(Ok((len, peer))) => {
                    self.on_request(len, peer, root, config, &mut transfers, &mut replay, now)
                        .await
                }
                Event::Datagram(Err(e)) => warn!("receive failed: {e}"),
                Event::Pump => {
                    self.pump(&mut transfers, &mut replay, config.burst).await;
                    // Other tasks on this runtime get a turn between bursts.
                    tokio::task::yield_now().await;
                }
                Event::Deadline => {}
            }

            let purged = replay.purge(now);
            if purged > 0 {
                trace!("expired {purged} replay entries");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_request<R: ServedRoot + ?Sized>(
        &self,
        len: usize,
        peer: SocketAddr,
        root: &R,
        config: &ServerConfig,
        transfers: &mut HashMap<TransferKey, ServerTransfer>,
        replay: &mut ReplayCache,
        now: Instant,
    ) {
        let Some(frame) = self.decode_frame(len, peer, frame_type::INITIATE) else {
            return;
        };
        let request = match Request::decode(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping request from {peer}: {e}");
                return;
            }
        };

        let key = (peer, request.request_id);
        if let Some(active) = transfers.get(&key) {
            if active.request() == &request {
                debug!("{peer} request {} still streaming, duplicate ignored", request.request_id);
            } else {
                warn!("{peer} reused busy request id {}, dropped", request.request_id);
            }
            return;
        }

        if let Some(datagram) = replay.replay(peer, &request, now) {
            debug!("{peer} request {} repeated, replaying last response", request.request_id);
            self.send(datagram, peer).await;
            return;
        }
        replay.forget(peer, request.request_id);

        info!("{peer} request {}: {:?} {:?}", request.request_id, request.tag, request.path);
        transfers.insert(key, ServerTransfer::accept(peer, request, root, config.default_chunk));
    }

    async fn pump(
        &self,
        transfers: &mut HashMap<TransferKey, ServerTransfer>,
        replay: &mut ReplayCache,
        burst: usize,
    ) {
        let keys: Vec<TransferKey> = transfers.keys().copied().collect();
        for key in keys {
            let Some(transfer) = transfers.get_mut(&key) else {
                continue;
            };

            let mut last = None;
            for _ in 0..burst.max(1) {
                let Some(response) = transfer.next_response() else {
                    break;
                };
                match response.to_datagram() {
                    Ok(datagram) => {
                        trace!("{} <- {:?} #{} ({} bytes)", key.0, response.tag, response.sequence, response.data.len());
                        self.send(&datagram, key.0).await;
                        last = Some(datagram);
                    }
                    Err(e) => warn!("cannot frame response #{} for {}: {e}", response.sequence, key.0),
                }
                if transfer.is_finished() {
                    break;
                }
            }

            if transfer.is_finished() {
                if let Some(transfer) = transfers.remove(&key) {
                    info!("{} request {} {:?}", key.0, key.1, transfer.state());
                    if let Some(datagram) = last {
                        replay.remember(key.0, transfer.request().clone(), datagram, Instant::now());
                    }
                }
            }
        }
    }

    /// Run one client transfer against `server` to its end.
    ///
    /// Responses carry no request id, so a client keeps a single transfer in
    /// flight per server and routes by peer address. Whatever is still queued
    /// from an earlier transfer is discarded first; see [`Self::ephemeral_for`]
    /// for datagrams that arrive later than that.
    pub async fn fetch<S: TransferSink + ?Sized>(
        &mut self,
        server: SocketAddr,
        request: Request,
        config: &ClientConfig,
        sink: &mut S,
    ) -> Result<Result<(), TransferError>, FatalError> {
        let mut transfer = match ClientTransfer::new(server, request, config, Instant::now()) {
            Ok(transfer) => transfer,
            Err(e) => return Ok(Err(TransferError::from(e))),
        };
        self.discard_queued();
        debug!("sending request {} to {server}", transfer.request().request_id);
        self.send(transfer.datagram(), server).await;

        while !transfer.is_finished() {
            let event = self.wait(false, transfer.deadline()).await;
            let now = Instant::now();
            match event {
                Event::Shutdown => return Err(FatalError::Interrupted),
                Event::Datagram(Ok((len, peer))) => {
                    if peer != transfer.peer() {
                        debug!("dropping datagram from unexpected peer {peer}");
                        continue;
                    }
                    if let Some(response) = self.decode_response(len, peer) {
                        trace!("{peer} -> {:?} #{} ({} bytes)", response.tag, response.sequence, response.data.len());
                        transfer.on_response(response, now);
                    }
                }
                Event::Datagram(Err(e)) => warn!("receive failed: {e}"),
                Event::Deadline => {
                    if let Some(datagram) = transfer.on_deadline(now) {
                        self.send(&datagram, server).await;
                    }
                }
                Event::Pump => {}
            }

            for chunk in transfer.take_ready() {
                if let Err(e) = sink.deliver(chunk) {
                    transfer.abort(TransferError::from(e));
                    break;
                }
            }
        }

        Ok(match transfer.state() {
            ClientState::Failed(e) => Err(e.clone()),
            _ => Ok(()),
        })
    }

    fn discard_queued(&mut self) {
        let mut stale = 0;
        while let Ok((_, peer)) = self.socket.try_recv_from(&mut self.recv_buf) {
            trace!("discarding stale datagram from {peer}");
            stale += 1;
        }
        if stale > 0 {
            debug!("discarded {stale} stale datagrams before a new request");
        }
    }

    fn decode_response(&self, len: usize, peer: SocketAddr) -> Option<Response> {
        let frame = self.decode_frame(len, peer, frame_type::FIRST | frame_type::CONNECTED)?;
        match Response::decode(&frame.payload) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("dropping response from {peer}: {e}");
                None
            }
        }
    }
}
