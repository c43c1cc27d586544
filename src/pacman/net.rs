//! Address-normalization helpers and the local-hosts resolver override
//! (§4.3 step 3: "the local-only resolver (PreferGo equivalent; its
//! resolver Dial rejects network use) to mirror `/etc/hosts`").
//!
//! The Go source gets this by configuring `net.Resolver{PreferGo: true,
//! Dial: <always errors>}`, which forces the stdlib resolver down its
//! pure-Go path and then makes every path that would hit the network for
//! an actual DNS query fail, leaving only `/etc/hosts` (and `NSS`-free
//! static lookups) able to answer. There's no equivalent resolver mode in
//! Rust's ecosystem without pulling in a full DNS stack, so this mirrors
//! the *observable effect* directly: a small cache of `/etc/hosts`
//! parsed once at startup.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

#[cfg(unix)]
const HOSTS_PATH: &str = "/etc/hosts";

/// Normalizes a bind/listen address, accepting the `":PORT"` shorthand for
/// "all interfaces" that `SocketAddr`'s `FromStr` rejects.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        Cow::Owned(format!("0.0.0.0:{port}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// A point-in-time snapshot of `/etc/hosts`, consulted unconditionally on
/// every routing-table dial (§4.3 step 3).
pub struct HostsResolver {
    entries: HashMap<String, IpAddr>,
}

impl HostsResolver {
    pub fn load() -> Self {
        #[cfg(unix)]
        {
            Self::load_from(Path::new(HOSTS_PATH))
        }
        #[cfg(not(unix))]
        {
            Self { entries: HashMap::new() }
        }
    }

    fn load_from(path: &Path) -> Self {
        let mut entries = HashMap::new();
        if let Ok(contents) = std::fs::read_to_string(path) {
            for line in contents.lines() {
                let line = match line.split_once('#') {
                    Some((before, _)) => before,
                    None => line,
                };
                let mut fields = line.split_whitespace();
                let Some(ip_field) = fields.next() else { continue };
                let Ok(ip) = ip_field.parse::<IpAddr>() else { continue };
                for name in fields {
                    entries.entry(name.to_ascii_lowercase()).or_insert(ip);
                }
            }
        }
        Self { entries }
    }

    /// Returns the first matching IP for `host`, matching the source's
    /// `ips[0]` (§4.3 Open Question: "only the FIRST returned IP").
    pub fn lookup(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        self.entries.get(&host.to_ascii_lowercase()).copied()
    }
}

impl Default for HostsResolver {
    fn default() -> Self {
        Self::load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":11078").as_ref(), "0.0.0.0:11078");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:11078").as_ref(),
            "127.0.0.1:11078"
        );
    }

    #[test]
    fn parses_hosts_file_ignoring_comments() {
        let dir = std::env::temp_dir().join(format!("pacman-hosts-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hosts");
        std::fs::write(&path, "# comment\n127.0.0.1 localhost\n10.0.0.5 internal.example.com # trailing\n").unwrap();

        let resolver = HostsResolver::load_from(&path);
        assert_eq!(resolver.lookup("localhost"), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(
            resolver.lookup("internal.example.com"),
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(resolver.lookup("unknown.example.com"), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ip_literal_passes_through() {
        let resolver = HostsResolver { entries: HashMap::new() };
        assert_eq!(resolver.lookup("1.2.3.4"), Some("1.2.3.4".parse().unwrap()));
    }
}
