pub mod cidr;
pub mod host;

use std::net::IpAddr;

use cidr::Cidr;
use host::Host;
use ipnet::IpNet;

/// The combined host-routing trie: exact/zone hostname matching plus a CIDR
/// sub-index, behind one `match(host) -> V` interface.
///
/// Lookup precedence (§4.1): exact -> CIDR (when the input parses as an IP)
/// -> longest zone-suffix match.
pub struct Trie<V> {
    hosts: Host<V>,
    cidrs: Cidr<V>,
}

/// A hostname rule key, as written in config (`hosts: [...]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// `example.com`
    Exact(String),
    /// `.example.com`
    Zone(String),
    /// `*.example.com`
    Wildcard(String),
    Cidr(IpNet),
    Ip(IpAddr),
}

impl Key {
    pub fn parse(raw: &str) -> Key {
        let raw = raw.trim();
        if let Ok(net) = raw.parse::<IpNet>() {
            return Key::Cidr(net);
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Key::Ip(ip);
        }
        if let Some(suffix) = raw.strip_prefix("*.") {
            return Key::Wildcard(suffix.to_string());
        }
        if let Some(suffix) = raw.strip_prefix('.') {
            return Key::Zone(suffix.to_string());
        }
        Key::Exact(raw.to_string())
    }
}

impl<V> Default for Trie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Trie<V> {
    pub fn new() -> Self {
        Self {
            hosts: Host::new(),
            cidrs: Cidr::new(),
        }
    }

    pub fn insert(&mut self, key: &Key, value: V)
    where
        V: Clone,
    {
        match key {
            Key::Exact(h) => self.hosts.insert(h, value),
            Key::Zone(h) => self.hosts.insert(&format!(".{h}"), value),
            Key::Wildcard(h) => self.hosts.insert(&format!("*.{h}"), value),
            Key::Cidr(net) => self.cidrs.insert(*net, value),
            Key::Ip(ip) => {
                let net = IpNet::new(*ip, full_prefix_len(ip)).expect("full-length prefix is valid");
                self.cidrs.insert(net, value)
            }
        }
    }

    pub fn matches(&self, host: &str) -> Option<&V> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if let Some(v) = self.cidrs.matches(ip) {
                return Some(v);
            }
        }
        self.hosts.matches(host)
    }

    pub fn walk(&self) -> impl Iterator<Item = (&str, &V)> {
        self.hosts.walk()
    }

    pub fn walk_cidrs(&self) -> impl Iterator<Item = (IpNet, &V)> {
        self.cidrs.iter()
    }
}

fn full_prefix_len(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_then_cidr_then_zone_precedence() {
        let mut t: Trie<&str> = Trie::new();
        t.insert(&Key::parse("*.example.com"), "zone");
        t.insert(&Key::parse("10.0.0.0/24"), "cidr");
        t.insert(&Key::parse("api.example.com"), "exact");

        assert_eq!(t.matches("api.example.com"), Some(&"exact"));
        assert_eq!(t.matches("foo.example.com"), Some(&"zone"));
        assert_eq!(t.matches("10.0.0.5"), Some(&"cidr"));
    }

    #[test]
    fn bare_ip_promoted_to_full_length_prefix() {
        let mut t: Trie<&str> = Trie::new();
        t.insert(&Key::parse("10.0.0.5"), "one-host");
        assert_eq!(t.matches("10.0.0.5"), Some(&"one-host"));
        assert_eq!(t.matches("10.0.0.6"), None);
    }
}
