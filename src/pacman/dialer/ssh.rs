//! Outbound SSH dialer adapter (§4.11), grounded in
//! `pkg/dialer/ssh.go`: an SSH client session over the forwarding dialer,
//! exposing `direct-tcpip` channel opens as a `ContextDialer` and the
//! session's disconnect as `Liveness`.
//!
//! No example in the retrieved pack uses `russh`/`russh-keys`, so the
//! client handshake below is authored from the crate's documented shape
//! rather than copied from a sibling use site: `client::connect_stream`
//! over the already-forwarded byte stream, a `client::Handler` that
//! accepts any host key (see below), password/key auth from the URL, and
//! `channel_open_direct_tcpip` per dial.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use tokio::sync::Notify;
use url::Url;

use super::{BoxConn, ContextDialer, Liveness, Upstream};
use crate::pacman::error::PacmanError;

/// Accepts any host key. Matches the source's `ssh.InsecureIgnoreHostKey`:
/// this dialer is a convenience for reaching a corporate jump host the
/// operator already named explicitly in their config, not a security
/// boundary against it, so there's no host-key pinning to bypass safely
/// here — it's simply out of scope.
struct AcceptAnyHostKey {
    disconnected: Arc<Notify>,
}

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn disconnected(&mut self) -> Result<(), Self::Error> {
        self.disconnected.notify_waiters();
        Ok(())
    }
}

pub struct SshProxy {
    handle: Arc<client::Handle<AcceptAnyHostKey>>,
}

#[async_trait]
impl ContextDialer for SshProxy {
    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxConn> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("ssh dialer only supports tcp, got {network}"),
            ));
        }
        let (host, port) = super::split_host_port(addr)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(&host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(Box::new(channel.into_stream()))
    }
}

struct SshLiveness {
    disconnected: Arc<Notify>,
}

#[async_trait]
impl Liveness for SshLiveness {
    async fn wait(&self) -> Option<io::Error> {
        self.disconnected.notified().await;
        Some(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "ssh session disconnected",
        ))
    }
}

struct SshCloser {
    handle: Arc<client::Handle<AcceptAnyHostKey>>,
    closed: AtomicBool,
}

#[async_trait]
impl super::lazy::Closer for SshCloser {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
    }
}

pub async fn dial_upstream(url: &Url, forward: Arc<dyn ContextDialer>) -> anyhow::Result<Upstream> {
    let host = url
        .host_str()
        .ok_or_else(|| PacmanError::ConfigError(format!("ssh proxy URL missing host: {url}")))?
        .to_string();
    let port = url.port().unwrap_or(22);
    let addr = format!("{host}:{port}");
    let user = url.username().to_string();

    let identity = url
        .query_pairs()
        .find(|(k, _)| k == "identity")
        .map(|(_, v)| v.into_owned());
    let password = url.password().map(|p| p.to_string());

    let stream = forward.dial("tcp", &addr).await?;
    let disconnected = Arc::new(Notify::new());
    let config = Arc::new(client::Config::default());
    let handler = AcceptAnyHostKey {
        disconnected: disconnected.clone(),
    };

    let mut handle = client::connect_stream(config, stream, handler).await?;

    let mut authenticated = false;
    if let Some(path) = &identity {
        let key = russh_keys::load_secret_key(Path::new(path.as_str()), None)
            .map_err(|e| anyhow::anyhow!("ssh identity {path:?}: {e}"))?;
        authenticated = handle
            .authenticate_publickey(&user, Arc::new(key))
            .await?;
    }
    if !authenticated {
        if let Some(pass) = &password {
            authenticated = handle.authenticate_password(&user, pass).await?;
        }
    }
    if !authenticated {
        anyhow::bail!("ssh authentication failed for {user}@{addr} (no accepted password or identity)");
    }

    let handle = Arc::new(handle);
    let closer = SshCloser {
        handle: handle.clone(),
        closed: AtomicBool::new(false),
    };
    let liveness = SshLiveness { disconnected };
    let dialer = SshProxy { handle };

    Ok(Upstream {
        dialer: Arc::new(dialer),
        liveness: Some(Arc::new(liveness)),
        closer: Some(Arc::new(closer)),
    })
}
