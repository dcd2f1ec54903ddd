//! End-to-end transfers over loopback.
//!
//! Every test runs a real daemon event loop in a background task against a
//! `tempfile` directory and drives a client event loop from the test body.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use fftp::config::{ClientConfig, RetryPolicy, ServerConfig};
use fftp::error::{FatalError, TransferError};
use fftp::event_loop::EventLoop;
use fftp::frame::Frame;
use fftp::message::{Request, Response};
use fftp::protocol::{frame_type, RequestTag, ResponseTag};
use fftp::resource::FsRoot;
use fftp::shutdown_mgr::ShutdownManager;
use fftp::sink::{Listing, WriteSink};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Start a daemon on an OS-chosen port serving `root`.
async fn start_server(
    root: &Path,
    default_chunk: usize,
) -> (SocketAddr, ShutdownManager, JoinHandle<Result<(), FatalError>>) {
    let shutdown = ShutdownManager::new();
    let mut event_loop = EventLoop::bind(loopback(), shutdown.clone()).await.unwrap();
    let addr = event_loop.local_addr();
    let root = FsRoot::new(root).unwrap();
    let mut config = ServerConfig::new(addr, root.path());
    config.default_chunk = default_chunk;

    let handle = tokio::spawn(async move { event_loop.serve(&root, &config).await });
    (addr, shutdown, handle)
}

async fn client() -> EventLoop {
    EventLoop::bind(loopback(), ShutdownManager::new()).await.unwrap()
}

fn config(timeout_ms: u64, max_retries: u32) -> ClientConfig {
    ClientConfig {
        retry: RetryPolicy {
            timeout: Duration::from_millis(timeout_ms),
            max_retries,
        },
        ..ClientConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn get(
    event_loop: &mut EventLoop,
    server: SocketAddr,
    request: Request,
    config: &ClientConfig,
) -> Result<Vec<u8>, TransferError> {
    let mut sink = WriteSink::new(Vec::new());
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        event_loop.fetch(server, request, config, &mut sink),
    )
    .await
    .expect("transfer hung")
    .expect("fatal error");
    outcome.map(|()| sink.into_inner())
}

async fn list(
    event_loop: &mut EventLoop,
    server: SocketAddr,
    request: Request,
) -> Result<Vec<String>, TransferError> {
    let mut listing = Listing::for_tag(request.tag);
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        event_loop.fetch(server, request, &config(200, 5), &mut listing),
    )
    .await
    .expect("transfer hung")
    .expect("fatal error");
    outcome.map(|()| listing.into_names())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// 150000 bytes at 65000 per chunk: two CHUNKs and a 20000 byte TERM.
#[tokio::test]
async fn get_reassembles_multi_chunk_file() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(150_000);
    fs::write(dir.path().join("big.bin"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 65_000, "big.bin");
    let received = get(&mut client, server, request, &config(200, 5)).await.unwrap();
    assert_eq!(received.len(), 150_000);
    assert_eq!(received, contents);
}

/// Many small chunks, ending in an empty TERM since the size divides evenly.
#[tokio::test]
async fn get_with_small_chunks_is_byte_exact() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(40_000);
    fs::write(dir.path().join("data"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 3, 1000, "data");
    let received = get(&mut client, server, request, &config(200, 5)).await.unwrap();
    assert_eq!(received, contents);
}

#[tokio::test]
async fn zero_buffer_size_uses_daemon_default() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(10_000);
    fs::write(dir.path().join("f"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 512).await;

    let mut client = client().await;
    let chunk = Request::new(RequestTag::Chunk, 0, 0, "f");
    let first = get(&mut client, server, chunk, &config(200, 5)).await.unwrap();
    assert_eq!(first, &contents[..512]);

    let whole = Request::new(RequestTag::Get, 1, 0, "f");
    assert_eq!(get(&mut client, server, whole, &config(200, 5)).await.unwrap(), contents);
}

#[tokio::test]
async fn ls_lists_root_entries() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    fs::create_dir(dir.path().join("b")).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let names = list(&mut client, server, Request::new(RequestTag::Ls, 0, 65_000, "/"))
        .await
        .unwrap();
    assert_eq!(names, ["a.txt", "b"]);
}

#[tokio::test]
async fn entry_returns_one_page() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    for name in ["x", "y", "z"] {
        fs::write(dir.path().join("sub").join(name), b"").unwrap();
    }
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let names = list(&mut client, server, Request::new(RequestTag::Entry, 0, 3, "sub"))
        .await
        .unwrap();
    assert_eq!(names, ["x", "y"]);
}

#[tokio::test]
async fn missing_path_fails_with_not_found() {
    let dir = TempDir::new().unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 65_000, "nope");
    let err = get(&mut client, server, request, &config(200, 5)).await.unwrap_err();
    assert_eq!(err, TransferError::ServerError("not found".into()));
}

#[tokio::test]
async fn path_outside_root_is_refused() {
    let dir = TempDir::new().unwrap();
    let inner = dir.path().join("served");
    fs::create_dir(&inner).unwrap();
    fs::write(dir.path().join("secret"), b"keep out").unwrap();
    let (server, _shutdown, _handle) = start_server(&inner, 2048).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 65_000, "../secret");
    let err = get(&mut client, server, request, &config(200, 5)).await.unwrap_err();
    assert_eq!(err, TransferError::ServerError("path outside root".into()));
}

#[tokio::test]
async fn ls_on_a_file_is_refused() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let err = list(&mut client, server, Request::new(RequestTag::Ls, 0, 65_000, "a.txt"))
        .await
        .unwrap_err();
    assert_eq!(err, TransferError::ServerError("not a directory".into()));
}

/// Garbage and tampered frames are dropped; the daemon keeps serving.
#[tokio::test]
async fn corrupt_datagrams_do_not_disturb_the_daemon() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let noise = UdpSocket::bind(loopback()).await.unwrap();
    noise.send_to(b"garbage", server).await.unwrap();
    noise.send_to(&[], server).await.unwrap();
    let mut tampered = Request::new(RequestTag::Get, 0, 100, "a.txt").to_datagram().unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    noise.send_to(&tampered, server).await.unwrap();
    // A well formed frame with a response role is not a request either.
    let wrong_role = Frame::encode(frame_type::FIRST, &Request::new(RequestTag::Ls, 0, 0, "").encode().unwrap()).unwrap();
    noise.send_to(&wrong_role, server).await.unwrap();

    // Nothing comes back for any of them.
    let mut buf = [0u8; 128];
    assert!(tokio::time::timeout(Duration::from_millis(200), noise.recv_from(&mut buf))
        .await
        .is_err());

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 100, "a.txt");
    assert_eq!(get(&mut client, server, request, &config(200, 5)).await.unwrap(), b"hello");
}

/// Against a peer that never answers: the request goes out `1 + max_retries`
/// times, byte for byte the same, then the transfer times out.
#[tokio::test]
async fn silent_server_times_out_after_retries() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let server = silent.local_addr().unwrap();

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 7, 100, "a.txt");
    let expected = request.to_datagram().unwrap();
    let err = get(&mut client, server, request, &config(30, 2)).await.unwrap_err();
    assert_eq!(err, TransferError::Timeout);

    let mut buf = vec![0u8; 4096];
    for _ in 0..3 {
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), silent.recv_from(&mut buf))
            .await
            .expect("missing retransmission")
            .unwrap();
        assert_eq!(&buf[..len], expected.as_slice());
    }
    assert!(tokio::time::timeout(Duration::from_millis(100), silent.recv_from(&mut buf))
        .await
        .is_err());
}

/// A repeated identical request is answered from the replay cache rather
/// than by reading the file again.
#[tokio::test]
async fn repeated_request_is_replayed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.txt");
    fs::write(&path, b"first").unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 100, "a.txt");
    assert_eq!(get(&mut client, server, request.clone(), &config(200, 5)).await.unwrap(), b"first");

    fs::write(&path, b"second").unwrap();
    assert_eq!(get(&mut client, server, request, &config(200, 5)).await.unwrap(), b"first");

    // A new request id starts a fresh transfer.
    let fresh = Request::new(RequestTag::Get, 1, 100, "a.txt");
    assert_eq!(get(&mut client, server, fresh, &config(200, 5)).await.unwrap(), b"second");
}

/// Response carried by `datagram`, if it is a valid frame.
fn response_of(datagram: &[u8]) -> Option<Response> {
    Frame::decode(datagram)
        .ok()
        .and_then(|frame| Response::decode(&frame.payload).ok())
}

/// Relay between one client and `server`. Every datagram coming back from the
/// server goes through `alter` first; `None` drops it.
async fn relay<F>(server: SocketAddr, mut alter: F) -> SocketAddr
where
    F: FnMut(Vec<u8>) -> Option<Vec<u8>> + Send + 'static,
{
    let relay = UdpSocket::bind(loopback()).await.unwrap();
    let addr = relay.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 70_000];
        let mut client = None;
        loop {
            let Ok((len, from)) = relay.recv_from(&mut buf).await else {
                return;
            };
            if from != server {
                client = Some(from);
                let _ = relay.send_to(&buf[..len], server).await;
                continue;
            }
            if let (Some(client), Some(datagram)) = (client, alter(buf[..len].to_vec())) {
                let _ = relay.send_to(&datagram, client).await;
            }
        }
    });
    addr
}

/// Apply `change` to the first response tagged `tag`, pass everything else.
fn first_with_tag<F>(tag: ResponseTag, mut change: F) -> impl FnMut(Vec<u8>) -> Option<Vec<u8>> + Send + 'static
where
    F: FnMut(Vec<u8>) -> Option<Vec<u8>> + Send + 'static,
{
    let mut done = false;
    move |datagram| {
        if !done && response_of(&datagram).is_some_and(|response| response.tag == tag) {
            done = true;
            return change(datagram);
        }
        Some(datagram)
    }
}

fn flip_last_bit(mut datagram: Vec<u8>) -> Option<Vec<u8>> {
    let last = datagram.len() - 1;
    datagram[last] ^= 0x01;
    Some(datagram)
}

#[tokio::test]
async fn lost_term_is_recovered_by_resending_the_request() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(5000);
    fs::write(dir.path().join("f"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;
    let relay = relay(server, first_with_tag(ResponseTag::Term, |_| None)).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 1000, "f");
    assert_eq!(get(&mut client, relay, request, &config(50, 5)).await.unwrap(), contents);
}

#[tokio::test]
async fn sequential_transfers_share_one_client_socket() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("one"), b"1").unwrap();
    fs::write(dir.path().join("two"), b"22").unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    for (id, (name, body)) in [("one", &b"1"[..]), ("two", &b"22"[..])].into_iter().enumerate() {
        let request = Request::new(RequestTag::Get, id as u8, 100, name);
        assert_eq!(get(&mut client, server, request, &config(200, 5)).await.unwrap(), body);
    }
}

#[tokio::test]
async fn shutdown_stops_the_daemon() {
    let dir = TempDir::new().unwrap();
    let (_server, mut shutdown, handle) = start_server(dir.path(), 2048).await;

    shutdown.send();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_interrupts_a_client_transfer() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let server = silent.local_addr().unwrap();
    let shutdown = ShutdownManager::new();
    let mut trigger = shutdown.clone();
    let mut client = EventLoop::bind(loopback(), shutdown).await.unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.send();
    });

    let mut sink = Listing::for_tag(RequestTag::Ls);
    let request = Request::new(RequestTag::Ls, 0, 100, "");
    let result = client.fetch(server, request, &config(1000, 5), &mut sink).await;
    assert!(matches!(result, Err(FatalError::Interrupted)));
}

// ---------------------------------------------------------------------------
// Isolation between transfers
// ---------------------------------------------------------------------------

/// Minimal daemon stand-in: answers request id 0 with `TERM#0 "AAAA"` twice,
/// as a network duplicate would, and request id 1 with `TERM#0 "BBBB"`.
async fn duplicating_server() -> SocketAddr {
    let socket = UdpSocket::bind(loopback()).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Some(request) = Frame::decode(&buf[..len])
                .ok()
                .and_then(|frame| Request::decode(&frame.payload).ok())
            else {
                continue;
            };
            let (body, copies) = match request.request_id {
                0 => (b"AAAA", 2),
                _ => (b"BBBB", 1),
            };
            let datagram = Response::new(ResponseTag::Term, 0, body.to_vec()).to_datagram().unwrap();
            for _ in 0..copies {
                let _ = socket.send_to(&datagram, peer).await;
            }
        }
    });
    addr
}

#[tokio::test]
async fn queued_duplicate_is_not_taken_by_the_next_transfer() {
    let server = duplicating_server().await;
    let mut client = client().await;

    let first = Request::new(RequestTag::Get, 0, 100, "a");
    assert_eq!(get(&mut client, server, first, &config(200, 5)).await.unwrap(), b"AAAA");
    // Let the duplicate land in the socket queue.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = Request::new(RequestTag::Get, 1, 100, "b");
    assert_eq!(get(&mut client, server, second, &config(200, 5)).await.unwrap(), b"BBBB");
}

#[tokio::test]
async fn each_transfer_on_a_fresh_socket_ignores_late_duplicates() {
    let server = duplicating_server().await;

    let mut first_loop = EventLoop::ephemeral_for(server, ShutdownManager::new()).await.unwrap();
    let first = Request::new(RequestTag::Get, 0, 100, "a");
    assert_eq!(get(&mut first_loop, server, first, &config(200, 5)).await.unwrap(), b"AAAA");

    let mut second_loop = EventLoop::ephemeral_for(server, ShutdownManager::new()).await.unwrap();
    assert_ne!(first_loop.local_addr().port(), second_loop.local_addr().port());
    let second = Request::new(RequestTag::Get, 1, 100, "b");
    assert_eq!(get(&mut second_loop, server, second, &config(200, 5)).await.unwrap(), b"BBBB");
}

/// Two clients at once: the failing transfer leaves the streaming one alone.
#[tokio::test]
async fn concurrent_clients_are_isolated() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(100_000);
    fs::write(dir.path().join("big"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut streaming = client().await;
    let mut failing = client().await;
    let cfg = config(200, 5);
    let (good, bad) = tokio::join!(
        get(&mut streaming, server, Request::new(RequestTag::Get, 0, 2000, "big"), &cfg),
        get(&mut failing, server, Request::new(RequestTag::Get, 0, 2000, "missing"), &cfg),
    );
    assert_eq!(good.unwrap(), contents);
    assert_eq!(bad.unwrap_err(), TransferError::ServerError("not found".into()));
}

/// One peer, two request ids in flight. Responses carry no id, so they are
/// told apart by tag: the missing path yields the only ERR.
#[tokio::test]
async fn one_peer_two_request_ids_in_flight() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(20_000);
    fs::write(dir.path().join("big"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let peer = UdpSocket::bind(loopback()).await.unwrap();
    let get_big = Request::new(RequestTag::Get, 0, 1000, "big").to_datagram().unwrap();
    let get_missing = Request::new(RequestTag::Get, 1, 1000, "missing").to_datagram().unwrap();
    peer.send_to(&get_big, server).await.unwrap();
    peer.send_to(&get_missing, server).await.unwrap();

    let mut chunks = std::collections::BTreeMap::new();
    let mut errors = Vec::new();
    let mut term = None;
    let mut buf = vec![0u8; 4096];
    while term.is_none() || errors.is_empty() {
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .expect("daemon went quiet")
            .unwrap();
        let response = response_of(&buf[..len]).expect("valid response");
        match response.tag {
            ResponseTag::Err => errors.push(response),
            ResponseTag::Term => {
                term = Some(response.sequence);
                chunks.insert(response.sequence, response.data);
            }
            _ => {
                chunks.insert(response.sequence, response.data);
            }
        }
    }

    assert_eq!(errors, [Response::error(0, "not found")]);
    assert_eq!(term, Some(20));
    assert_eq!(chunks.len(), 21);
    assert_eq!(chunks.into_values().flatten().collect::<Vec<u8>>(), contents);
}

#[cfg(unix)]
#[tokio::test]
async fn ls_keeps_newlines_inside_names() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), b"").unwrap();
    fs::write(dir.path().join("odd\nname"), b"").unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;

    let mut client = client().await;
    let names = list(&mut client, server, Request::new(RequestTag::Ls, 0, 100, ""))
        .await
        .unwrap();
    assert_eq!(names, ["a.txt", "odd\nname"]);
}

// ---------------------------------------------------------------------------
// Damaged responses
// ---------------------------------------------------------------------------

/// A TERM that fails its checksum is dropped; resending the request gets the
/// replayed TERM and the file arrives intact.
#[tokio::test]
async fn corrupt_term_is_dropped_and_recovered() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(5500);
    fs::write(dir.path().join("f"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;
    let relay = relay(server, first_with_tag(ResponseTag::Term, flip_last_bit)).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 1000, "f");
    assert_eq!(get(&mut client, relay, request, &config(50, 5)).await.unwrap(), contents);
}

/// A corrupt first CHUNK leaves a gap nothing can fill: the transfer times
/// out instead of delivering the damaged bytes.
#[tokio::test]
async fn corrupt_chunk_never_reaches_the_sink() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(5500);
    fs::write(dir.path().join("f"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;
    let relay = relay(server, first_with_tag(ResponseTag::Chunk, flip_last_bit)).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 1000, "f");
    let mut sink = WriteSink::new(Vec::new());
    let outcome = client.fetch(relay, request, &config(30, 3), &mut sink).await.unwrap();
    assert_eq!(outcome, Err(TransferError::Timeout));
    assert_eq!(sink.written(), 0, "bytes delivered past a gap");
}

/// A well formed frame with a request role is not a response.
#[tokio::test]
async fn response_with_request_role_is_dropped() {
    let dir = TempDir::new().unwrap();
    let contents = pattern(5500);
    fs::write(dir.path().join("f"), &contents).unwrap();
    let (server, _shutdown, _handle) = start_server(dir.path(), 2048).await;
    let relabel = |datagram: Vec<u8>| {
        let frame = Frame::decode(&datagram).ok()?;
        Frame::encode(frame_type::INITIATE, &frame.payload).ok()
    };
    let relay = relay(server, first_with_tag(ResponseTag::Chunk, relabel)).await;

    let mut client = client().await;
    let request = Request::new(RequestTag::Get, 0, 1000, "f");
    let mut sink = WriteSink::new(Vec::new());
    let outcome = client.fetch(relay, request, &config(30, 3), &mut sink).await.unwrap();
    assert_eq!(outcome, Err(TransferError::Timeout));
    assert_eq!(sink.written(), 0);
}
