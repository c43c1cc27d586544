//! Ordered fail-over composition of dialers (§4.5). Sequential, no
//! parallel attempts, no scoring — the lazy dialer's own `Failed` state
//! already gives each link its circuit-breaking.

use std::sync::Arc;

use async_trait::async_trait;

use super::{BoxConn, ContextDialer};

pub struct Chain(pub Vec<Arc<dyn ContextDialer>>);

#[async_trait]
impl ContextDialer for Chain {
    async fn dial(&self, network: &str, addr: &str) -> std::io::Result<BoxConn> {
        let mut errors = Vec::new();
        for dialer in &self.0 {
            match dialer.dial(network, addr).await {
                Ok(conn) => return Ok(conn),
                Err(err) => errors.push(err.to_string()),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("all dialers in chain failed: {}", errors.join("; ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct AlwaysFail;
    #[async_trait]
    impl ContextDialer for AlwaysFail {
        async fn dial(&self, _network: &str, _addr: &str) -> io::Result<BoxConn> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "down"))
        }
    }

    struct AlwaysOk;
    #[async_trait]
    impl ContextDialer for AlwaysOk {
        async fn dial(&self, _network: &str, _addr: &str) -> io::Result<BoxConn> {
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }
    }

    #[tokio::test]
    async fn falls_through_to_next_link_on_failure() {
        let chain = Chain(vec![Arc::new(AlwaysFail), Arc::new(AlwaysOk)]);
        let result = chain.dial("tcp", "example.com:443").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn reports_joined_error_when_all_fail() {
        let chain = Chain(vec![Arc::new(AlwaysFail), Arc::new(AlwaysFail)]);
        let result = chain.dial("tcp", "example.com:443").await;
        assert!(result.is_err());
    }
}
