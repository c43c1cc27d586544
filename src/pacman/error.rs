//! Error kinds per the dispatcher's error taxonomy.
//!
//! Cancellation causes (`CloseRequested`/`IdleTimeout`/`UnderlyingClosed`) are
//! not variants here: they never escape as a `std::error::Error` to a client,
//! only as [`crate::pacman::dialer::lazy::CancelCause`] on the lazy dialer's
//! observation stream.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PacmanError {
    #[error("proxy not found: {0}")]
    ProxyNotFound(String),

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("dial to upstream proxy failed: {0}")]
    UpstreamDialError(#[source] io::Error),

    #[error("upstream accepted connection but could not reach destination: {0}")]
    RemoteDialError(#[source] io::Error),

    #[error("malformed client request: {0}")]
    ProtocolError(String),

    #[error("config error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, PacmanError>;
