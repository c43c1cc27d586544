//! The `Default` direct dialer: plain TCP with a bounded connect timeout.
//! Used by the routing table when no rule matches (§4.3 step 4).

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{BoxConn, ContextDialer};

pub struct Direct {
    pub connect_timeout: Duration,
}

impl Direct {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ContextDialer for Direct {
    async fn dial(&self, network: &str, addr: &str) -> std::io::Result<BoxConn> {
        if network != "tcp" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("direct dialer only supports tcp, got {network}"),
            ));
        }
        let conn = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        Ok(Box::new(conn))
    }
}
