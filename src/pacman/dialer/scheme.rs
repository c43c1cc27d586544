//! Upstream scheme dispatch (§4.10, ambient redesign).
//!
//! The source keeps a dynamic global registry (`pkg/dialer/dailer.go`'s
//! `ctxSchemes` map, populated by each scheme module's `init()` calling
//! `RegisterDialerType`). That pattern has no compile-time guarantee every
//! registration actually ran, and its lookup is string-keyed at the call
//! site. `UpstreamScheme` replaces it with a closed enum parsed once per
//! pool entry and matched exhaustively at factory-construction time.

use std::time::Duration;

use url::Url;

use super::lazy::Upstream;
use super::{http, socks5, ssh, vpn};
use crate::pacman::error::{PacmanError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Socks5,
    Ssh,
    AnyConnect,
    Gp,
}

impl UpstreamScheme {
    pub fn parse(scheme: &str) -> Result<Self> {
        match scheme {
            "http" | "https" => Ok(UpstreamScheme::Http),
            "socks5" | "socks5h" => Ok(UpstreamScheme::Socks5),
            "ssh" => Ok(UpstreamScheme::Ssh),
            "anyconnect" => Ok(UpstreamScheme::AnyConnect),
            "gp" => Ok(UpstreamScheme::Gp),
            other => Err(PacmanError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// The idle timeout a pool entry's lazy dialer uses, from `?timeout=<secs>`
/// on the proxy URL. Default one hour; `0` disables the idle timer
/// entirely (the lazy dialer treats a zero duration as "never evict").
pub fn idle_timeout(url: &Url) -> Duration {
    match url
        .query_pairs()
        .find(|(k, _)| k == "timeout")
        .and_then(|(_, v)| v.parse::<u64>().ok())
    {
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_TIMEOUT,
    }
}

/// Builds the upstream handle for one pool entry, via a forwarding dialer
/// (the chain leading up to this proxy in a multi-hop rule, or the direct
/// dialer for the first hop).
pub async fn build(
    url: &Url,
    forward: std::sync::Arc<dyn super::ContextDialer>,
) -> anyhow::Result<Upstream> {
    let scheme = UpstreamScheme::parse(url.scheme())?;
    match scheme {
        UpstreamScheme::Http => http::dial_upstream(url, forward).await,
        UpstreamScheme::Socks5 => socks5::dial_upstream(url, forward).await,
        UpstreamScheme::Ssh => ssh::dial_upstream(url, forward).await,
        UpstreamScheme::AnyConnect | UpstreamScheme::Gp => vpn::dial_upstream(url, forward).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_schemes() {
        assert_eq!(UpstreamScheme::parse("http").unwrap(), UpstreamScheme::Http);
        assert_eq!(UpstreamScheme::parse("socks5").unwrap(), UpstreamScheme::Socks5);
        assert_eq!(UpstreamScheme::parse("ssh").unwrap(), UpstreamScheme::Ssh);
        assert_eq!(
            UpstreamScheme::parse("anyconnect").unwrap(),
            UpstreamScheme::AnyConnect
        );
        assert_eq!(UpstreamScheme::parse("gp").unwrap(), UpstreamScheme::Gp);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            UpstreamScheme::parse("ftp"),
            Err(PacmanError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn idle_timeout_defaults_to_one_hour() {
        let url = Url::parse("http://proxy:3128").unwrap();
        assert_eq!(idle_timeout(&url), Duration::from_secs(3600));
    }

    #[test]
    fn idle_timeout_reads_query_param() {
        let url = Url::parse("http://proxy:3128?timeout=30").unwrap();
        assert_eq!(idle_timeout(&url), Duration::from_secs(30));
    }

    #[test]
    fn idle_timeout_zero_disables() {
        let url = Url::parse("http://proxy:3128?timeout=0").unwrap();
        assert_eq!(idle_timeout(&url), Duration::from_secs(0));
    }
}
