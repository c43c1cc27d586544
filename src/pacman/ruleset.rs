//! Rule compilation (§4.2): config rules -> a routing trie of
//! [`RouteEntry`]s, resolved against the current pool.
//!
//! Grounded in `app.go`'s `LoadConfig` rule loop: each rule's proxy names
//! are resolved against the pool in order, an empty resolved chain becomes
//! the bypass marker, a single entry is used directly, and two or more are
//! wrapped in [`Chain`]. Compilation is total -- the first unresolvable
//! proxy name aborts the whole reload rather than partially applying a
//! ruleset, matching the source's all-or-nothing `LoadConfig` return.

use std::sync::Arc;

use crate::pacman::config::Config;
use crate::pacman::dialer::by_host::RouteEntry;
use crate::pacman::dialer::chain::Chain;
use crate::pacman::dialer::pool::Pool;
use crate::pacman::dialer::ContextDialer;
use crate::pacman::error::{PacmanError, Result};
use crate::pacman::trie::{Key, Trie};

/// Resolves one rule's proxy-name list against the pool and compiles it to
/// a [`RouteEntry`] (§4.2 step 2).
fn compile_chain(pool: &Pool, proxy_names: &[String]) -> Result<RouteEntry> {
    let mut dialers = Vec::with_capacity(proxy_names.len());
    for name in proxy_names {
        let entry = pool
            .get(name)
            .ok_or_else(|| PacmanError::ProxyNotFound(name.clone()))?;
        dialers.push(Arc::new(entry.dialer.clone()) as Arc<dyn ContextDialer>);
    }

    Ok(match dialers.len() {
        0 => RouteEntry::Direct,
        1 => RouteEntry::Dialer(dialers.into_iter().next().unwrap()),
        _ => RouteEntry::Dialer(Arc::new(Chain(dialers))),
    })
}

/// Compiles every rule in `config` into a fresh trie (§4.2 step 3-4). The
/// caller is responsible for swapping it into the live [`super::dialer::by_host::ByHost`]
/// atomically once this returns `Ok`.
pub fn compile(config: &Config, pool: &Pool) -> Result<Trie<RouteEntry>> {
    let mut trie = Trie::new();
    for rule in &config.rules {
        let entry = compile_chain(pool, &rule.proxies)?;
        for host in &rule.hosts {
            trie.insert(&Key::parse(host), entry.clone());
        }
    }
    Ok(trie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacman::config::Rule;
    use std::collections::HashMap;
    use url::Url;

    fn config_with_rules(proxies: &[(&str, &str)], rules: Vec<Rule>) -> Config {
        let mut p = HashMap::new();
        for (name, url) in proxies {
            p.insert(name.to_string(), Url::parse(url).unwrap());
        }
        Config {
            listen: None,
            proxies: p,
            rules,
        }
    }

    #[test]
    fn empty_chain_compiles_to_direct() {
        let config = config_with_rules(
            &[],
            vec![Rule {
                hosts: vec!["example.com".into()],
                proxies: vec![],
            }],
        );
        let (pool, _) = crate::pacman::dialer::pool::Pool::empty().reconcile(&config.proxies);
        let trie = compile(&config, &pool).unwrap();
        assert!(matches!(trie.matches("example.com"), Some(RouteEntry::Direct)));
    }

    #[test]
    fn single_proxy_chain_compiles_to_its_dialer() {
        let config = config_with_rules(
            &[("corp", "http://proxy:3128")],
            vec![Rule {
                hosts: vec!["*.internal.example.com".into()],
                proxies: vec!["corp".into()],
            }],
        );
        let (pool, _) = crate::pacman::dialer::pool::Pool::empty().reconcile(&config.proxies);
        let trie = compile(&config, &pool).unwrap();
        assert!(matches!(
            trie.matches("svc.internal.example.com"),
            Some(RouteEntry::Dialer(_))
        ));
    }

    #[test]
    fn unresolvable_proxy_name_fails_the_whole_compile() {
        let config = config_with_rules(
            &[],
            vec![Rule {
                hosts: vec!["example.com".into()],
                proxies: vec!["missing".into()],
            }],
        );
        let (pool, _) = crate::pacman::dialer::pool::Pool::empty().reconcile(&config.proxies);
        let err = compile(&config, &pool).unwrap_err();
        assert!(matches!(err, PacmanError::ProxyNotFound(name) if name == "missing"));
    }
}
