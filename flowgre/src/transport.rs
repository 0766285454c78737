//! UDP plumbing shared by every pipeline.
//!
//! Sends are best effort. A failed send is returned to the caller, which
//! decides whether the worker carries on or stops.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    ops::Range,
};

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Source ports picked when none is configured
pub const SRC_PORT_RANGE: Range<u16> = 10_000..15_000;

/// Largest datagram a listener will accept
pub const RECV_BUFFER_BYTES: usize = 65_536;

/// Random ports tried before giving up on an in-use range
const BIND_ATTEMPTS: usize = 16;

#[derive(thiserror::Error, Debug)]
/// Errors produced by transport helpers.
pub enum Error {
    /// Error binding UDP socket
    #[error("Failed to bind UDP socket to {addr}: {source}")]
    Bind {
        /// Binding address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error sending a datagram
    #[error("Failed to send packet to {addr}: {source}")]
    Send {
        /// Destination address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Host and port did not resolve
    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        /// Host as given
        host: String,
        /// Port as given
        port: u16,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Host resolved to no addresses
    #[error("{0} resolved to no addresses")]
    NoAddress(String),
}

/// Resolve `host` and `port` to a socket address, preferring IPv4.
///
/// # Errors
///
/// Fails if the name does not resolve or resolves to nothing.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            port,
            source: Box::new(source),
        })?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::NoAddress(host.to_string()))
}

/// Bind a socket for sending to `dest`.
///
/// With `src_port` of `None` a random port from [`SRC_PORT_RANGE`] is used,
/// retrying a few times if the port is taken.
///
/// # Errors
///
/// Fails if the socket cannot be bound.
pub async fn bind_sender<R>(
    rng: &mut R,
    dest: SocketAddr,
    src_port: Option<u16>,
) -> Result<UdpSocket, Error>
where
    R: Rng + ?Sized,
{
    let ip = match dest.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    if let Some(port) = src_port {
        return bind(SocketAddr::new(ip, port)).await;
    }

    let mut attempt = 0;
    loop {
        let addr = SocketAddr::new(ip, rng.random_range(SRC_PORT_RANGE));
        match bind(addr).await {
            Err(Error::Bind { source, .. })
                if source.kind() == io::ErrorKind::AddrInUse && attempt + 1 < BIND_ATTEMPTS =>
            {
                trace!("source port {} in use, retrying", addr.port());
                attempt += 1;
            }
            res => return res,
        }
    }
}

/// Bind a socket listening on `addr`.
///
/// # Errors
///
/// Fails if the socket cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket, Error> {
    let socket = UdpSocket::bind(addr).await.map_err(|source| Error::Bind {
        addr,
        source: Box::new(source),
    })?;
    debug!("UDP socket bound to {addr}");
    Ok(socket)
}

/// Send `buf` to `dest` through `socket`, returning bytes written.
///
/// # Errors
///
/// Fails if the datagram could not be written.
pub async fn send_packet(socket: &UdpSocket, dest: SocketAddr, buf: &[u8]) -> Result<usize, Error> {
    socket
        .send_to(buf, dest)
        .await
        .map_err(|source| Error::Send {
            addr: dest,
            source: Box::new(source),
        })
}
