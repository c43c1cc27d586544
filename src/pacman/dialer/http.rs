//! HTTP CONNECT upstream-proxy client dialer.
//!
//! No crate in the retrieved pack implements an HTTP-CONNECT *client* (the
//! pack's HTTP-CONNECT code is all server-side, accepting CONNECT rather
//! than issuing it), so this is hand-rolled against RFC 7231 §4.3.6
//! directly: connect to the proxy, send a CONNECT request line plus an
//! optional `Proxy-Authorization: Basic` header, and treat any `2xx`
//! status as success. The proxy's own transport is plaintext TCP — as in
//! the source's `golang.org/x/net/proxy` HTTP dialer, a corporate HTTP
//! CONNECT proxy is reached over plain TCP; TLS, if any, applies to the
//! tunneled destination after the tunnel is established, not to the hop
//! to the proxy itself.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use super::{BoxConn, ContextDialer, Upstream};
use crate::pacman::error::PacmanError;

pub struct HttpProxy {
    forward: Arc<dyn ContextDialer>,
    proxy_addr: String,
    auth_header: Option<String>,
}

impl HttpProxy {
    fn new(url: &Url, forward: Arc<dyn ContextDialer>) -> anyhow::Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| PacmanError::ConfigError(format!("proxy URL missing host: {url}")))?;
        let port = url.port().unwrap_or(80);
        let proxy_addr = format!("{host}:{port}");

        let auth_header = if !url.username().is_empty() || url.password().is_some() {
            let user = url.username();
            let pass = url.password().unwrap_or("");
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            Some(format!("Basic {encoded}"))
        } else {
            None
        };

        Ok(HttpProxy {
            forward,
            proxy_addr,
            auth_header,
        })
    }
}

#[async_trait]
impl ContextDialer for HttpProxy {
    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxConn> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("http proxy dialer only supports tcp, got {network}"),
            ));
        }

        let mut conn = self.forward.dial("tcp", &self.proxy_addr).await.map_err(|err| {
            io::Error::new(
                err.kind(),
                PacmanError::UpstreamDialError(err).to_string(),
            )
        })?;

        let mut request = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n");
        if let Some(auth) = &self.auth_header {
            request.push_str("Proxy-Authorization: ");
            request.push_str(auth);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        conn.write_all(request.as_bytes()).await?;

        let status = read_connect_status_line(&mut *conn).await?;
        if !(200..300).contains(&status) {
            let remote_err = io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy CONNECT to {addr} rejected with status {status}"),
            );
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                PacmanError::RemoteDialError(remote_err).to_string(),
            ));
        }

        Ok(conn)
    }
}

/// Reads the CONNECT response's status line and discards headers up to the
/// blank line, one byte at a time so no bytes belonging to the tunneled
/// destination are ever buffered and lost.
async fn read_connect_status_line(conn: &mut dyn super::Conn) -> io::Result<u16> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    let mut blank_lines = 0;
    let mut status_line: Option<String> = None;

    loop {
        let n = conn.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed connection before completing CONNECT response",
            ));
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            if status_line.is_none() {
                status_line = Some(String::from_utf8_lossy(&line).trim().to_string());
            }
            if line == b"\r\n" {
                blank_lines += 1;
            }
            line.clear();
            if blank_lines > 0 {
                break;
            }
        }
    }

    let status_line = status_line.unwrap_or_default();
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed CONNECT response status line: {status_line:?}"),
            )
        })
}

pub async fn dial_upstream(url: &Url, forward: Arc<dyn ContextDialer>) -> anyhow::Result<Upstream> {
    let dialer = HttpProxy::new(url, forward)?;
    Ok(Upstream {
        dialer: Arc::new(dialer),
        liveness: None,
        closer: None,
    })
}
