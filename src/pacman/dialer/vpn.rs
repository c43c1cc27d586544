//! SSL-VPN tunnel dialer (§4.9): interface only.
//!
//! The source's `anyconnect`/`gp` schemes (`pkg/dialer/oc/oc.go`) wrap
//! `openconnect`, a C library reached over cgo, with interactive
//! credential/OTP/browser-auth prompts routed through a notifier. Binding
//! a C VPN library is out of scope for a pure-Rust crate (no such
//! dependency appears anywhere in the retrieved pack), so this module
//! keeps only the seam: a `TunnelDialer` trait a real implementation
//! could satisfy, and a default that reports the scheme as unavailable
//! rather than silently treating it as unroutable.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::{ContextDialer, Liveness, Upstream};
use crate::pacman::collab::Notifier;

/// A pluggable SSL-VPN connector. `dial` performs whatever handshake the
/// tunnel technology requires (credential prompts go through `notifier`)
/// and returns a dialer scoped to the tunnel's private network, plus its
/// liveness signal.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(
        &self,
        url: &Url,
        forward: Arc<dyn ContextDialer>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<(Arc<dyn ContextDialer>, Option<Arc<dyn Liveness>>)>;
}

/// No tunnel technology is wired in by default; `anyconnect://`/`gp://`
/// proxies fail fast at factory time rather than being silently accepted
/// and then failing every dial.
pub struct NotAvailable;

#[async_trait]
impl TunnelDialer for NotAvailable {
    async fn dial(
        &self,
        url: &Url,
        _forward: Arc<dyn ContextDialer>,
        _notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<(Arc<dyn ContextDialer>, Option<Arc<dyn Liveness>>)> {
        anyhow::bail!(
            "no SSL-VPN tunnel implementation is compiled in for scheme {:?}",
            url.scheme()
        )
    }
}

pub async fn dial_upstream(url: &Url, forward: Arc<dyn ContextDialer>) -> anyhow::Result<Upstream> {
    let notifier = Arc::new(crate::pacman::collab::LoggingNotifier) as Arc<dyn Notifier>;
    let (dialer, liveness) = NotAvailable.dial(url, forward, notifier).await?;
    Ok(Upstream {
        dialer,
        liveness,
        closer: None,
    })
}
