//! CIDR sub-index: a list of networks kept sorted by prefix length
//! descending, so the first containing match is always the longest-prefix
//! (most specific) one.

use std::net::IpAddr;

use ipnet::IpNet;

pub struct Cidr<V> {
    entries: Vec<(IpNet, V)>,
}

impl<V> Default for Cidr<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Cidr<V> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, net: IpNet, value: V) {
        let ones = net.prefix_len();
        let pos = self
            .entries
            .iter()
            .position(|(existing, _)| existing.prefix_len() < ones)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (net, value));
    }

    pub fn matches(&self, ip: IpAddr) -> Option<&V> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (IpNet, &V)> {
        self.entries.iter().map(|(n, v)| (*n, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut t = Cidr::new();
        t.insert("10.0.0.0/8".parse().unwrap(), "A");
        t.insert("10.1.0.0/16".parse().unwrap(), "B");
        assert_eq!(t.matches("10.1.2.3".parse().unwrap()), Some(&"B"));
        assert_eq!(t.matches("10.2.3.4".parse().unwrap()), Some(&"A"));
    }

    #[test]
    fn insertion_order_does_not_affect_precedence() {
        let mut t = Cidr::new();
        t.insert("10.1.0.0/16".parse().unwrap(), "B");
        t.insert("10.0.0.0/8".parse().unwrap(), "A");
        assert_eq!(t.matches("10.1.2.3".parse().unwrap()), Some(&"B"));
    }

    #[test]
    fn no_match_outside_any_network() {
        let mut t: Cidr<&str> = Cidr::new();
        t.insert("10.0.0.0/8".parse().unwrap(), "A");
        assert_eq!(t.matches("192.168.1.1".parse().unwrap()), None);
    }
}
