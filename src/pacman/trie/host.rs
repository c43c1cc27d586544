//! Hostname trie: exact, zone (wildcard-suffix), and reversed-label fail-fast
//! tree, matching longest-suffix-wins semantics.
//!
//! Values are stored only in `exact`/`wildcard`; `root` exists purely so a
//! non-matching lookup can bail out in O(depth) instead of scanning every
//! inserted suffix.

use std::collections::HashMap;

/// `None` child means "this is a wildcard terminal" (the suffix built from
/// the labels walked so far has an entry in `wildcard`).
type Node = HashMap<String, Option<Box<NodeMap>>>;
type NodeMap = Node;

pub struct Host<V> {
    exact: HashMap<String, V>,
    wildcard: HashMap<String, V>,
    root: Node,
}

impl<V> Default for Host<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Host<V> {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            root: HashMap::new(),
        }
    }

    /// Inserts a hostname rule.
    ///
    /// A prefix of `.` matches the base domain and all subdomains. A prefix
    /// of `*.` matches only subdomains. Anything else is an exact literal.
    pub fn insert(&mut self, host: &str, value: V)
    where
        V: Clone,
    {
        let host = canonicalize(host);

        if let Some(suffix) = host.strip_prefix("*.") {
            self.insert_wildcard(suffix, value);
            return;
        }

        if let Some(suffix) = host.strip_prefix('.') {
            self.insert_wildcard(suffix, value.clone());
            self.insert_exact(suffix, value);
            return;
        }

        self.insert_exact(&host, value);
    }

    fn insert_exact(&mut self, host: &str, value: V) {
        self.exact.insert(host.to_string(), value);
    }

    fn insert_wildcard(&mut self, suffix: &str, value: V) {
        self.wildcard.insert(suffix.to_string(), value);

        let labels = split_host(suffix);
        let mut node = &mut self.root;
        let mut i = labels.len();
        while i > 0 {
            i -= 1;
            let label = &labels[i];
            if node.contains_key(label) && node.get(label).unwrap().is_some() {
                node = node.get_mut(label).unwrap().as_deref_mut().unwrap();
                continue;
            }
            // Build the remaining labels (0..=i) as a fresh linear chain,
            // preserving whatever child (possibly none) already sat at this
            // label, as the chain's terminal entry.
            let existing_child = node.remove(label).flatten();
            let mut child = existing_child;
            for j in 0..i {
                let mut next = HashMap::new();
                next.insert(labels[j].clone(), child);
                child = Some(Box::new(next));
            }
            node.insert(label.clone(), child);
            break;
        }
    }

    /// Finds the most specific match for the given hostname.
    pub fn matches(&self, host: &str) -> Option<&V> {
        let host = canonicalize(host);

        if let Some(v) = self.exact.get(&host) {
            return Some(v);
        }

        let labels = split_host(&host);
        let mut node = &self.root;
        let mut j = 0usize;
        let mut broke = false;
        let mut i = labels.len();
        while i > 0 {
            i -= 1;
            let label = &labels[i];
            match node.get(label) {
                None => {
                    j = i;
                    broke = true;
                    break;
                }
                Some(None) => {
                    let suffix = labels[i..].join(".");
                    return self.wildcard.get(&suffix);
                }
                Some(Some(child)) => {
                    node = &**child;
                }
            }
        }

        if !broke {
            return None;
        }

        // Backtrack forward from j+1 through increasingly specific suffixes.
        let mut offset = 0usize;
        for label in &labels[..=j] {
            offset += label.len() + 1;
        }
        for label in &labels[j + 1..] {
            let suffix = &host[offset..];
            if let Some(v) = self.wildcard.get(suffix) {
                return Some(v);
            }
            offset += label.len() + 1;
        }

        None
    }

    /// Yields every inserted key (exact hosts, then `*.`-prefixed zones), for
    /// PAC emission.
    pub fn walk(&self) -> impl Iterator<Item = (&str, &V)> {
        self.exact
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(self.wildcard.iter().map(|(k, v)| (k.as_str(), v)))
    }
}

fn split_host(host: &str) -> Vec<&str> {
    host.split('.').collect()
}

fn canonicalize(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_subdomains_not_apex() {
        let mut t = Host::new();
        t.insert("*.example.com", 1);
        assert_eq!(t.matches("foo.example.com"), Some(&1));
        assert_eq!(t.matches("a.b.example.com"), Some(&1));
        assert_eq!(t.matches("example.com"), None);
    }

    #[test]
    fn leading_dot_matches_apex_and_subdomains() {
        let mut t = Host::new();
        t.insert(".example.com", 1);
        assert_eq!(t.matches("example.com"), Some(&1));
        assert_eq!(t.matches("foo.example.com"), Some(&1));
    }

    #[test]
    fn most_specific_wildcard_wins() {
        let mut t = Host::new();
        t.insert("*.b.c", 1);
        t.insert("*.a.b.c", 2);
        assert_eq!(t.matches("x.a.b.c"), Some(&2));
        assert_eq!(t.matches("x.b.c"), Some(&1));
    }

    #[test]
    fn exact_beats_wildcard() {
        let mut t = Host::new();
        t.insert("*.example.com", 1);
        t.insert("foo.example.com", 2);
        assert_eq!(t.matches("foo.example.com"), Some(&2));
    }

    #[test]
    fn unmatched_host_returns_none() {
        let mut t = Host::new();
        t.insert("*.example.com", 1);
        assert_eq!(t.matches("example.org"), None);
    }

    #[test]
    fn case_and_whitespace_are_normalized() {
        let mut t = Host::new();
        t.insert("Example.COM", 1);
        assert_eq!(t.matches(" example.com "), Some(&1));
    }
}
