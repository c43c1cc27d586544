//! The HTTP proxy front-end (§4.7) and its PAC responder (§4.8).
//!
//! Grounded in the teacher's `proxy::serve_tcp_with_shutdown` accept/serve
//! shape and in `dialer/http.rs`'s hand-rolled request/response line
//! parsing -- no crate in the retrieved pack parses HTTP proxy requests
//! (the pack's HTTP surfaces are all either a CONNECT *client* or axum's
//! full HTTP server, neither of which speaks forward-proxy semantics), so
//! the request line and headers are read the same deliberate way as the
//! CONNECT client reads a status line: byte-by-byte via the buffered
//! reader already produced by [`super::mux`], never over-reading into the
//! tunneled body.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::pacman::dialer::by_host::{ByHost, RouteEntry};
use crate::pacman::dialer::ContextDialer;
use crate::pacman::error::PacmanError;
use crate::pacman::mux::{MuxConn, SubListener};

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Wraps a client-request parsing failure as the §7 taxonomy's
/// `ProtocolError`, surfaced to the caller as a plain `io::Error` since
/// every front-end here already propagates `std::io::Result`.
fn protocol_error(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        PacmanError::ProtocolError(msg.into()).to_string(),
    )
}

/// Wraps a failed dial to the rule-selected upstream (as opposed to a
/// failure reported back *by* that upstream) as §7's `UpstreamDialError`.
fn upstream_dial_error(err: std::io::Error) -> PacmanError {
    PacmanError::UpstreamDialError(err)
}

struct ParsedRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> u64 {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

async fn read_request_line_and_headers(
    stream: &mut (impl AsyncBufReadExt + Unpin),
) -> std::io::Result<ParsedRequest> {
    let mut budget = MAX_HEADER_BYTES;
    let mut line = String::new();
    read_capped_line(stream, &mut line, &mut budget).await?;
    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    if method.is_empty() || target.is_empty() {
        return Err(protocol_error("malformed request line"));
    }

    let mut headers = Vec::new();
    loop {
        let mut header_line = String::new();
        read_capped_line(stream, &mut header_line, &mut budget).await?;
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    Ok(ParsedRequest {
        method,
        target,
        headers,
    })
}

async fn read_capped_line(
    stream: &mut (impl AsyncBufReadExt + Unpin),
    line: &mut String,
    budget: &mut usize,
) -> std::io::Result<()> {
    let n = stream.read_line(line).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "client closed connection before completing request headers",
        ));
    }
    *budget = budget
        .checked_sub(n)
        .ok_or_else(|| protocol_error("request headers too large"))?;
    Ok(())
}

/// Generates a PAC script mirroring the routing trie (§4.8). `server_host`
/// is the `Host` header of the PAC request itself -- every matched host
/// routes back through this same dispatcher process, so the script only
/// ever needs to say "PROXY <this process>" or "DIRECT", never which
/// upstream proxy a rule names.
pub struct PacHandler {
    by_host: Arc<ByHost>,
}

impl PacHandler {
    pub fn new(by_host: Arc<ByHost>) -> Self {
        Self { by_host }
    }

    pub fn render(&self, server_host: &str) -> String {
        let trie = self.by_host.snapshot();
        let mut script = String::new();
        script.push_str("function FindProxyForURL(url, host) {\n");

        let mut exact = Vec::new();
        let mut suffix = Vec::new();
        for (key, entry) in trie.walk() {
            if key.starts_with('.') {
                suffix.push((key.trim_start_matches('.').to_string(), entry));
            } else {
                exact.push((key.to_string(), entry));
            }
        }
        // `Trie::walk` doesn't distinguish an inserted `*.suffix` from a
        // `.suffix` zone's implicit subdomain half -- both land in the same
        // suffix bucket with identical `RouteEntry` semantics, so both are
        // emitted as one `dnsDomainIs` clause.
        suffix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        if !exact.is_empty() {
            script.push_str("  switch (host) {\n");
            for (host, entry) in &exact {
                script.push_str(&format!(
                    "    case {:?}: return {:?};\n",
                    host,
                    directive(server_host, entry)
                ));
            }
            script.push_str("  }\n");
        }

        for (zone, entry) in &suffix {
            script.push_str(&format!(
                "  if (dnsDomainIs(host, {:?})) return {:?};\n",
                format!(".{zone}"),
                directive(server_host, entry)
            ));
        }

        // CIDR entries are already held in descending-prefix-length order;
        // IPv6 networks have no standard `isInNet` form and are skipped.
        for (net, entry) in trie.walk_cidrs() {
            if let ipnet::IpNet::V4(net4) = net {
                script.push_str(&format!(
                    "  if (isInNet(host, {:?}, {:?})) return {:?};\n",
                    net4.network().to_string(),
                    net4.netmask().to_string(),
                    directive(server_host, entry)
                ));
            }
        }

        script.push_str("  return \"DIRECT\";\n}\n");
        script
    }
}

fn directive(server_host: &str, entry: &RouteEntry) -> String {
    match entry {
        RouteEntry::Direct => "DIRECT".to_string(),
        RouteEntry::Dialer(_) => format!("PROXY {server_host}"),
    }
}

async fn respond_pac(mut conn: MuxConn, handler: &PacHandler, server_host: &str) -> std::io::Result<()> {
    let body = handler.render(server_host);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/x-ns-proxy-autoconfig\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    conn.stream.write_all(response.as_bytes()).await?;
    conn.stream.flush().await
}

async fn respond_bad_request(mut conn: MuxConn) -> std::io::Result<()> {
    conn.stream
        .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
        .await?;
    conn.stream.flush().await
}

async fn handle_connect(mut conn: MuxConn, req: &ParsedRequest, by_host: &ByHost) -> std::io::Result<()> {
    let mut upstream = match by_host.dial("tcp", &req.target).await {
        Ok(upstream) => upstream,
        Err(err) => {
            let typed = upstream_dial_error(err);
            let body = typed.to_string();
            tracing::debug!(target = %req.target, error = %typed, "http proxy: CONNECT dial failed");
            let response = format!(
                "HTTP/1.1 503 Service Unavailable\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            conn.stream.write_all(response.as_bytes()).await?;
            return conn.stream.flush().await;
        }
    };

    conn.stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    conn.stream.flush().await?;

    tokio::io::copy_bidirectional(&mut conn.stream, &mut *upstream).await?;
    Ok(())
}

async fn handle_forward(mut conn: MuxConn, req: ParsedRequest, by_host: &ByHost) -> std::io::Result<()> {
    let url = url::Url::parse(&req.target)
        .map_err(|e| protocol_error(format!("bad absolute-URI: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| protocol_error("absolute-URI missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| protocol_error("absolute-URI missing port"))?;
    let addr = format!("{host}:{port}");

    let mut upstream = match by_host.dial("tcp", &addr).await {
        Ok(upstream) => upstream,
        Err(err) => {
            let typed = upstream_dial_error(err);
            let body = typed.to_string();
            tracing::debug!(%addr, error = %typed, "http proxy: forward dial failed");
            let response = format!(
                "HTTP/1.1 503 Service Unavailable\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            conn.stream.write_all(response.as_bytes()).await?;
            return conn.stream.flush().await;
        }
    };

    let path = if url.query().is_some() {
        format!("{}?{}", url.path(), url.query().unwrap())
    } else {
        url.path().to_string()
    };
    let mut rewritten = format!("{} {} HTTP/1.1\r\n", req.method, path);
    for (k, v) in &req.headers {
        if k.eq_ignore_ascii_case("proxy-connection") || k.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }
        rewritten.push_str(&format!("{k}: {v}\r\n"));
    }
    rewritten.push_str("\r\n");
    upstream.write_all(rewritten.as_bytes()).await?;

    let remaining = req.content_length();
    if remaining > 0 {
        let mut limited = (&mut conn.stream).take(remaining);
        tokio::io::copy(&mut limited, &mut upstream).await?;
    }
    upstream.flush().await?;

    tokio::io::copy(&mut upstream, &mut conn.stream).await?;
    conn.stream.flush().await?;
    Ok(())
}

/// Serves the catch-all HTTP/PAC front-end off a [`SubListener`] produced
/// by [`crate::pacman::mux::Mux::register`] with [`crate::pacman::mux::Mux::matches_default`].
pub async fn serve(mut listener: SubListener, by_host: Arc<ByHost>, pac: Option<Arc<PacHandler>>) {
    while let Some(conn) = listener.accept().await {
        let by_host = by_host.clone();
        let pac = pac.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(conn, by_host, pac).await {
                tracing::debug!(error = %err, "http proxy: connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    mut conn: MuxConn,
    by_host: Arc<ByHost>,
    pac: Option<Arc<PacHandler>>,
) -> std::io::Result<()> {
    let req = tokio::time::timeout(Duration::from_secs(10), read_request_line_and_headers(&mut conn.stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out reading request headers"))??;

    if req.method.eq_ignore_ascii_case("CONNECT") {
        return handle_connect(conn, &req, &by_host).await;
    }

    if req.target.contains("://") {
        return handle_forward(conn, req, &by_host).await;
    }

    match pac {
        Some(handler) => {
            let server_host = req.header("host").unwrap_or("").to_string();
            respond_pac(conn, &handler, &server_host).await
        }
        None => respond_bad_request(conn).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacman::net::HostsResolver;
    use crate::pacman::trie::{Key, Trie};

    #[test]
    fn pac_script_emits_direct_for_unmatched_and_proxy_for_matched() {
        let mut trie = Trie::new();
        trie.insert(&Key::parse("blocked.example.com"), RouteEntry::Direct);
        let by_host = Arc::new(ByHost::new(trie, HostsResolver::default()));
        let pac = PacHandler::new(by_host);

        let script = pac.render("127.0.0.1:11078");
        assert!(script.contains("function FindProxyForURL"));
        assert!(script.contains("\"DIRECT\""));
        assert!(script.contains("blocked.example.com"));
    }

    #[test]
    fn pac_script_skips_ipv6_cidrs() {
        let mut trie = Trie::new();
        trie.insert(&Key::parse("2001:db8::/32"), RouteEntry::Direct);
        let by_host = Arc::new(ByHost::new(trie, HostsResolver::default()));
        let pac = PacHandler::new(by_host);

        let script = pac.render("127.0.0.1:11078");
        assert!(!script.contains("isInNet"));
    }
}
