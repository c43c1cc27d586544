//! The proxy pool (§3/§5): one [`Lazy`] dialer per configured proxy,
//! reconciled across reloads so an unchanged proxy URL keeps its live
//! connection instead of being torn down and rebuilt.
//!
//! Grounded in `app.go`'s `LoadConfig`, which walks the new config's
//! `Proxies` map and only calls `NewPooledDialer` when there is no existing
//! entry for that label or its URL changed; an entry that's just being
//! carried forward keeps its lazy dialer (and, implicitly, whatever
//! Online/Connecting state it was already in) untouched.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use super::direct::Direct;
use super::lazy::{FactoryFn, Lazy};
use super::scheme;
use super::ContextDialer;
use crate::pacman::collab::{PoolEntryStatus, PoolStatus};

#[derive(Clone)]
pub struct PoolEntry {
    pub label: String,
    pub url: Url,
    pub dialer: Lazy,
}

impl PoolEntry {
    fn new(label: String, url: Url) -> Self {
        let idle_timeout = scheme::idle_timeout(&url);
        let factory_url = url.clone();
        let factory: FactoryFn = Arc::new(move || {
            let url = factory_url.clone();
            Box::pin(async move {
                // First hop always forwards over a plain direct dial; a
                // rule's multi-entry chain composes pool entries at the
                // ruleset layer (§4.2), not here.
                let forward: Arc<dyn ContextDialer> = Arc::new(Direct::default());
                scheme::build(&url, forward).await
            })
        });
        Self {
            label,
            url,
            dialer: Lazy::new(idle_timeout, factory),
        }
    }

    pub fn status(&self) -> PoolEntryStatus {
        let signal = self.dialer.status();
        PoolEntryStatus {
            label: self.label.clone(),
            url: self.url.to_string(),
            state: signal.state,
            error: signal.error,
        }
    }
}

/// The set of live pool entries, swapped wholesale on each reload.
#[derive(Default, Clone)]
pub struct Pool {
    entries: HashMap<String, PoolEntry>,
}

impl Pool {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, label: &str) -> Option<&PoolEntry> {
        self.entries.get(label)
    }

    pub fn status(&self) -> PoolStatus {
        let mut entries: Vec<_> = self.entries.values().map(PoolEntry::status).collect();
        entries.sort_by(|a, b| a.label.cmp(&b.label));
        PoolStatus { entries }
    }

    /// Builds the next pool generation from `proxies`, reusing this pool's
    /// entries whose URL is byte-for-byte unchanged. Returns the new pool
    /// and the entries that fell out (label no longer present, or present
    /// under a changed URL) so the caller can close them -- but only after
    /// the routing table has been swapped onto the new pool, so no in-flight
    /// dial loses its dialer out from under it.
    pub fn reconcile(&self, proxies: &HashMap<String, Url>) -> (Pool, Vec<PoolEntry>) {
        let mut next = HashMap::with_capacity(proxies.len());
        let mut stale = Vec::new();

        for (label, url) in proxies {
            match self.entries.get(label) {
                Some(existing) if &existing.url == url => {
                    next.insert(label.clone(), existing.clone());
                }
                _ => {
                    next.insert(label.clone(), PoolEntry::new(label.clone(), url.clone()));
                }
            }
        }

        for (label, entry) in &self.entries {
            let still_current = matches!(next.get(label), Some(kept) if kept.url == entry.url);
            if !still_current {
                stale.push(entry.clone());
            }
        }

        (Pool { entries: next }, stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn unchanged_url_keeps_same_entry() {
        let mut proxies = HashMap::new();
        proxies.insert("a".to_string(), url("http://proxy-a:3128"));
        let (pool, stale) = Pool::empty().reconcile(&proxies);
        assert!(stale.is_empty());

        let (pool2, stale2) = pool.reconcile(&proxies);
        assert!(stale2.is_empty());
        assert!(pool.get("a").unwrap().dialer.same_as(&pool2.get("a").unwrap().dialer));
    }

    #[test]
    fn changed_url_is_rebuilt_and_old_is_stale() {
        let mut proxies = HashMap::new();
        proxies.insert("a".to_string(), url("http://proxy-a:3128"));
        let (pool, _) = Pool::empty().reconcile(&proxies);

        let mut proxies2 = HashMap::new();
        proxies2.insert("a".to_string(), url("http://proxy-a:3129"));
        let (pool2, stale) = pool.reconcile(&proxies2);

        assert_eq!(stale.len(), 1);
        assert_eq!(pool2.get("a").unwrap().url.port(), Some(3129));
    }

    #[test]
    fn removed_proxy_becomes_stale() {
        let mut proxies = HashMap::new();
        proxies.insert("a".to_string(), url("http://proxy-a:3128"));
        let (pool, _) = Pool::empty().reconcile(&proxies);

        let (pool2, stale) = pool.reconcile(&HashMap::new());
        assert_eq!(stale.len(), 1);
        assert!(pool2.get("a").is_none());
    }
}
