//! SOCKS5 upstream-proxy client dialer, hand-rolled per RFC 1928 (and RFC
//! 1929 for username/password auth). No crate in the retrieved pack
//! implements a SOCKS5 client or server (confirmed by grepping every
//! `Cargo.toml` in the pack) — this is the protocol-plumbing work the
//! rest of this crate already does for HTTP CONNECT and the wire framing
//! underneath `mux`, just applied to a different RFC.
//!
//! CONNECT command only, matching the source's use of
//! `golang.org/x/net/proxy`'s SOCKS5 client, which this crate otherwise
//! has no equivalent dependency for.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use super::{BoxConn, ContextDialer, Upstream};
use crate::pacman::error::PacmanError;

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;

pub struct Socks5Proxy {
    forward: Arc<dyn ContextDialer>,
    proxy_addr: String,
    credentials: Option<(String, String)>,
}

impl Socks5Proxy {
    fn new(url: &Url, forward: Arc<dyn ContextDialer>) -> anyhow::Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| PacmanError::ConfigError(format!("proxy URL missing host: {url}")))?;
        let port = url.port().unwrap_or(1080);
        let proxy_addr = format!("{host}:{port}");

        let credentials = if !url.username().is_empty() || url.password().is_some() {
            Some((
                url.username().to_string(),
                url.password().unwrap_or("").to_string(),
            ))
        } else {
            None
        };

        Ok(Socks5Proxy {
            forward,
            proxy_addr,
            credentials,
        })
    }
}

#[async_trait]
impl ContextDialer for Socks5Proxy {
    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxConn> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("socks5 proxy dialer only supports tcp, got {network}"),
            ));
        }

        let (host, port) = super::split_host_port(addr)?;
        let mut conn = self.forward.dial("tcp", &self.proxy_addr).await.map_err(|err| {
            io::Error::new(
                err.kind(),
                PacmanError::UpstreamDialError(err).to_string(),
            )
        })?;

        negotiate_auth(&mut *conn, self.credentials.as_ref()).await?;
        connect(&mut *conn, &host, port).await?;

        Ok(conn)
    }
}

async fn negotiate_auth(
    conn: &mut dyn super::Conn,
    credentials: Option<&(String, String)>,
) -> io::Result<()> {
    let methods: &[u8] = if credentials.is_some() {
        &[AUTH_NONE, AUTH_USERPASS]
    } else {
        &[AUTH_NONE]
    };

    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    conn.write_all(&greeting).await?;

    let mut reply = [0u8; 2];
    conn.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(protocol_error("unexpected SOCKS version in method reply"));
    }

    match reply[1] {
        AUTH_NONE => Ok(()),
        AUTH_USERPASS => {
            let (user, pass) = credentials
                .ok_or_else(|| protocol_error("proxy requires auth but no credentials configured"))?;
            let mut req = vec![0x01, user.len() as u8];
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            conn.write_all(&req).await?;

            let mut resp = [0u8; 2];
            conn.read_exact(&mut resp).await?;
            if resp[1] != 0x00 {
                return Err(protocol_error("socks5 username/password auth failed"));
            }
            Ok(())
        }
        AUTH_NO_ACCEPTABLE => Err(protocol_error("proxy rejected all offered auth methods")),
        other => Err(protocol_error(&format!("unsupported auth method selected: {other}"))),
    }
}

async fn connect(conn: &mut dyn super::Conn, host: &str, port: u16) -> io::Result<()> {
    let mut req = vec![VERSION, CMD_CONNECT, 0x00];
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        req.push(ATYP_IPV4);
        req.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        req.push(ATYP_IPV6);
        req.extend_from_slice(&ip.octets());
    } else {
        if host.len() > 255 {
            return Err(protocol_error("destination hostname too long for SOCKS5"));
        }
        req.push(ATYP_DOMAIN);
        req.push(host.len() as u8);
        req.extend_from_slice(host.as_bytes());
    }
    req.extend_from_slice(&port.to_be_bytes());

    conn.write_all(&req).await?;

    let mut header = [0u8; 4];
    conn.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(protocol_error("unexpected SOCKS version in CONNECT reply"));
    }
    if header[1] != 0x00 {
        let remote_err = io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("socks5 CONNECT to {host}:{port} failed with reply code {}", header[1]),
        );
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            PacmanError::RemoteDialError(remote_err).to_string(),
        ));
    }

    // Consume (and discard) BND.ADDR/BND.PORT so no stray bytes are left
    // for the tunneled destination's data to be read alongside.
    match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4 + 2];
            conn.read_exact(&mut buf).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16 + 2];
            conn.read_exact(&mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            conn.read_exact(&mut buf).await?;
        }
        other => return Err(protocol_error(&format!("unknown BND.ADDR type: {other}"))),
    }

    Ok(())
}

fn protocol_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

pub async fn dial_upstream(url: &Url, forward: Arc<dyn ContextDialer>) -> anyhow::Result<Upstream> {
    let dialer = Socks5Proxy::new(url, forward)?;
    Ok(Upstream {
        dialer: Arc::new(dialer),
        liveness: None,
        closer: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn negotiates_no_auth() {
        let (mut client, mut server) = duplex(64);
        let negotiate = tokio::spawn(async move { negotiate_auth(&mut client, None).await });

        let mut greeting = [0u8; 2];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [VERSION, 1]);
        let mut method = [0u8; 1];
        server.read_exact(&mut method).await.unwrap();
        assert_eq!(method[0], AUTH_NONE);

        server.write_all(&[VERSION, AUTH_NONE]).await.unwrap();
        negotiate.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_no_acceptable_methods() {
        let (mut client, mut server) = duplex(64);
        let negotiate = tokio::spawn(async move { negotiate_auth(&mut client, None).await });

        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        server.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await.unwrap();

        assert!(negotiate.await.unwrap().is_err());
    }
}
