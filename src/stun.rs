//! Public address discovery for a daemon behind NAT.
//!
//! The query goes out over the daemon's own socket, so the answer is the
//! mapping clients will actually reach.

use std::net::{SocketAddr, ToSocketAddrs};

use log::debug;
use stunclient::StunClient;
use tokio::net::UdpSocket;

pub async fn public_address(socket: &UdpSocket, stun_server: &str) -> Result<SocketAddr, String> {
    let stun_addr = stun_server
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {stun_server}: {e}"))?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| format!("{stun_server} has no IPv4 address"))?;

    debug!("querying STUN server {stun_addr}");
    StunClient::new(stun_addr)
        .query_external_address_async(socket)
        .await
        .map_err(|e| format!("STUN request to {stun_addr} failed: {e:?}"))
}
