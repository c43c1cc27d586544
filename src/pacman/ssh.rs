//! SSH front-end server (§4.13): accepts inbound SSH connections off the
//! mux and relays `direct-tcpip` channel opens through the routing
//! dialer.
//!
//! Mirrors `dialer/ssh.rs`'s outbound client in driving `russh` over an
//! already-open byte stream rather than binding its own socket -- the
//! connection has already been sniffed and partially buffered by `mux`,
//! so this uses `server::run_stream` as the server-side counterpart to
//! the outbound client's `client::connect_stream`. No example in the
//! retrieved pack runs a `russh` server, so the `Handler` shape below is
//! authored from the crate's documented API rather than copied from a
//! sibling use site.
//!
//! Authentication accepts any credentials without verification: like the
//! outbound client's `AcceptAnyHostKey`, this mirrors the source's own
//! documented non-hardened design (`pkg/dialer` has no inbound SSH
//! counterpart at all -- this front-end is a supplemental addition per
//! §4.13's documented intent). Operators exposing it to an untrusted
//! network are expected to front it with their own authentication layer.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use russh_keys::key::{KeyPair, PublicKey};

use crate::pacman::dialer::by_host::ByHost;
use crate::pacman::dialer::ContextDialer;
use crate::pacman::mux::SubListener;

/// Loads the persisted host key at `path`, generating and saving a fresh
/// Ed25519 one if absent (§4.13: "loads/generates+persists host key on
/// startup").
pub fn load_or_generate_host_key(path: &Path) -> anyhow::Result<KeyPair> {
    if path.is_file() {
        return russh_keys::load_secret_key(path, None)
            .map_err(|e| anyhow::anyhow!("loading ssh host key {}: {e}", path.display()));
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("failed to generate an ed25519 host key"))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    russh_keys::encode_pkcs8_pem(&key, path)
        .map_err(|e| anyhow::anyhow!("persisting ssh host key {}: {e}", path.display()))?;
    Ok(key)
}

struct PacmanSshHandler {
    by_host: Arc<ByHost>,
    peer: SocketAddr,
}

#[async_trait]
impl server::Handler for PacmanSshHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, _user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let by_host = self.by_host.clone();
        let addr = format!("{host_to_connect}:{port_to_connect}");
        let peer = self.peer;
        let channel_id = channel.id();
        let handle = session.handle();

        tokio::spawn(async move {
            let mut upstream = match by_host.dial("tcp", &addr).await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::debug!(%peer, %addr, error = %err, "ssh front-end: direct-tcpip dial failed");
                    let _ = handle.close(channel_id).await;
                    return;
                }
            };
            let mut stream = channel.into_stream();
            if let Err(err) = tokio::io::copy_bidirectional(&mut stream, &mut *upstream).await {
                tracing::debug!(%peer, %addr, error = %err, "ssh front-end: relay ended with an error");
            }
        });

        Ok(true)
    }
}

/// Serves inbound SSH connections off the mux's `ssh` [`SubListener`].
pub async fn serve(mut listener: SubListener, by_host: Arc<ByHost>, host_key: KeyPair) {
    let config = Arc::new(server::Config {
        keys: vec![host_key],
        ..Default::default()
    });

    while let Some(conn) = listener.accept().await {
        let config = config.clone();
        let handler = PacmanSshHandler {
            by_host: by_host.clone(),
            peer: conn.peer,
        };
        let peer = conn.peer;
        tokio::spawn(async move {
            if let Err(err) = server::run_stream(config, conn.stream, handler).await {
                tracing::debug!(%peer, error = %err, "ssh front-end: session ended with an error");
            }
        });
    }
}
