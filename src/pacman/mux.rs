//! The connection multiplexer (§4.6): one TCP listener fanned out to
//! several protocol front-ends by sniffing the first byte off the wire.
//!
//! Grounded in the teacher's `proxy::serve_tcp_with_shutdown` accept-loop
//! shape (bind, `select!` on shutdown vs. `accept()`, spawn a per-connection
//! task), generalized here so the spawned task classifies the connection
//! before handing it to a per-protocol channel instead of a single fixed
//! handler.
//!
//! Matchers are registered in order and tried in that order; `Default`
//! (the HTTP/PAC front-end, whose matcher always returns `true`) must be
//! registered last or it would swallow everything. Whichever sub-server's
//! queue the byte matches gets a bounded 5-second window to accept the
//! handoff before the connection is dropped -- a stalled front-end should
//! not back up the shared listener indefinitely.
//!
//! Running the resulting [`SubListener`]s as a supervised group (so one
//! front-end's fatal error tears down its siblings instead of leaking
//! half a mux) is the caller's job, via the same `JoinSet` pattern
//! `app::run` already uses for its other listener tasks.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const QUEUE_DEPTH: usize = 32;

/// A sniffed, still-unconsumed connection handed to the protocol front-end
/// whose matcher claimed it. The peeked byte remains in `stream`'s buffer.
pub struct MuxConn {
    pub stream: BufStream<TcpStream>,
    pub peer: SocketAddr,
}

struct Registration {
    name: &'static str,
    matches: fn(u8) -> bool,
    tx: mpsc::Sender<MuxConn>,
}

/// The receiving half a protocol front-end polls for its share of
/// multiplexed connections.
pub struct SubListener {
    name: &'static str,
    rx: mpsc::Receiver<MuxConn>,
}

impl SubListener {
    pub async fn accept(&mut self) -> Option<MuxConn> {
        self.rx.recv().await
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Default)]
pub struct Mux {
    registrations: Vec<Registration>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a protocol front-end. `matches` is evaluated against the
    /// connection's first byte, without consuming it, in the order
    /// registrations were added -- the first `true` wins.
    pub fn register(&mut self, name: &'static str, matches: fn(u8) -> bool) -> SubListener {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        self.registrations.push(Registration { name, matches, tx });
        SubListener { name, rx }
    }

    /// SOCKS5 client greetings start with the version byte `0x05`.
    pub fn matches_socks5(first_byte: u8) -> bool {
        first_byte == 0x05
    }

    /// SSH identification strings begin "SSH-..."; `'S'` is sufficient to
    /// disambiguate from SOCKS5 and HTTP without buffering the whole line.
    pub fn matches_ssh(first_byte: u8) -> bool {
        first_byte == b'S'
    }

    /// The catch-all HTTP/PAC front-end. Must be registered last.
    pub fn matches_default(_first_byte: u8) -> bool {
        true
    }

    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let local_addr = listener.local_addr().ok();
        tracing::info!(listen_addr = ?local_addr, "mux: listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = listener.accept() => {
                    let (conn, peer) = res?;
                    let registrations: Vec<_> = self
                        .registrations
                        .iter()
                        .map(|r| (r.name, r.matches, r.tx.clone()))
                        .collect();
                    tokio::spawn(async move {
                        dispatch(conn, peer, registrations).await;
                    });
                }
            }
        }
        Ok(())
    }
}

async fn dispatch(
    conn: TcpStream,
    peer: SocketAddr,
    registrations: Vec<(&'static str, fn(u8) -> bool, mpsc::Sender<MuxConn>)>,
) {
    let mut stream = BufStream::new(conn);
    let first_byte = match stream.fill_buf().await {
        Ok(buf) if !buf.is_empty() => buf[0],
        Ok(_) => {
            tracing::debug!(%peer, "mux: connection closed before any bytes arrived");
            return;
        }
        Err(err) => {
            tracing::debug!(%peer, error = %err, "mux: error peeking first byte");
            return;
        }
    };

    for (name, matches, tx) in &registrations {
        if matches(first_byte) {
            let muxconn = MuxConn { stream, peer };
            match tokio::time::timeout(ENQUEUE_TIMEOUT, tx.send(muxconn)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    tracing::warn!(%peer, sub_server = name, "mux: front-end channel closed, dropping connection");
                }
                Err(_) => {
                    tracing::warn!(%peer, sub_server = name, "mux: front-end did not accept handoff within timeout");
                }
            }
            return;
        }
    }

    tracing::debug!(%peer, first_byte, "mux: no registered front-end matched");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_first_byte_in_registration_order() {
        let mut mux = Mux::new();
        let mut socks = mux.register("socks5", Mux::matches_socks5);
        let mut ssh = mux.register("ssh", Mux::matches_ssh);
        let mut default = mux.register("default", Mux::matches_default);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(mux.serve(listener, shutdown_rx));

        let mut socks_client = TcpStream::connect(addr).await.unwrap();
        socks_client.set_nodelay(true).ok();
        use tokio::io::AsyncWriteExt;
        socks_client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let mut http_client = TcpStream::connect(addr).await.unwrap();
        http_client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut got_socks = tokio::time::timeout(Duration::from_secs(1), socks.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_socks.stream.fill_buf().await.unwrap()[0], 0x05);

        let mut got_default = tokio::time::timeout(Duration::from_secs(1), default.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_default.stream.fill_buf().await.unwrap()[0], b'G');

        assert!(tokio::time::timeout(Duration::from_millis(50), ssh.accept())
            .await
            .is_err());
    }
}
