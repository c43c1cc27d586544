pub mod by_host;
pub mod chain;
pub mod direct;
pub mod http;
pub mod lazy;
pub mod pool;
pub mod scheme;
pub mod socks5;
pub mod ssh;
pub mod vpn;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected, owned byte stream returned by a dial.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> Conn for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxConn = Box<dyn Conn>;

/// The dispatcher's one dialing abstraction: every routing-table entry,
/// lazy dialer, and chain implements this.
#[async_trait]
pub trait ContextDialer: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> std::io::Result<BoxConn>;
}

/// Capability a dialer's constructed upstream handle may expose: an
/// explicit liveness signal, in place of the source's runtime `Wait()`
/// type assertion (§9 redesign — "runtime-typed liveness assertions").
#[async_trait]
pub trait Liveness: Send + Sync {
    /// Resolves when the underlying connection is no longer usable,
    /// yielding the reason if one is known.
    async fn wait(&self) -> Option<std::io::Error>;
}

// The constructed-upstream-handle type (`dialer` + optional `liveness` +
// optional `closer`) lives on `lazy::Upstream`, since it is the lazy
// dialer's factory return type and the closer field only makes sense next
// to the state machine that calls it.
pub use self::lazy::Upstream;

pub use super::net::normalize_bind_addr;

pub fn split_host_port(addr: &str) -> std::io::Result<(String, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("address missing port: {addr}"),
        )
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad port: {port}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, port))
}

pub fn to_socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    format!("{host}:{port}").parse().ok()
}
