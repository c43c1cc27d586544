//! Collaborator traits (§10): the boundaries the source crosses into
//! platform UI (`menuet`'s tray menu and native notifications) and
//! platform socket activation (`launchd`). This crate runs headless by
//! default; each trait's default implementation is a `tracing`-backed
//! stand-in so the rest of the dispatcher never has to know whether a
//! real GUI/menu/launchd integration is wired in.

use std::net::TcpListener;

use async_trait::async_trait;

use crate::pacman::dialer::lazy::ConnectionState;

#[derive(Debug, Clone)]
pub struct Notification {
    pub identifier: String,
    pub title: String,
    pub subtitle: String,
    pub message: String,
    pub response_placeholder: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Notification {
            identifier: String::new(),
            title: title.into(),
            subtitle: String::new(),
            message: message.into(),
            response_placeholder: None,
        }
    }
}

/// The user's reply to a `notify_with_reply` prompt, or the absence of one
/// (dismissed, or no interactive surface is available at all).
#[derive(Debug, Clone, Default)]
pub struct Response(pub Option<String>);

/// Display toasts and solicit replies (OTP codes, browser-auth
/// confirmations). Grounded in `pkg/notify/notify.go`'s
/// `Notify`/`WithChannel` pair.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, n: Notification);
    async fn notify_with_reply(&self, n: Notification) -> Response;
}

pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, n: Notification) {
        tracing::warn!(title = %n.title, subtitle = %n.subtitle, message = %n.message, "notification");
    }

    async fn notify_with_reply(&self, n: Notification) -> Response {
        tracing::warn!(
            title = %n.title,
            message = %n.message,
            "notification requires a reply but no interactive surface is configured; failing the prompt"
        );
        Response(None)
    }
}

/// One pool entry's point-in-time status, as shown by the menu bar's
/// per-proxy menu item in the source (`app.PooledDialer.MenuItem`) and by
/// this crate's admin `/pool` endpoint (§12).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolEntryStatus {
    pub label: String,
    pub url: String,
    pub state: ConnectionState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStatus {
    pub entries: Vec<PoolEntryStatus>,
}

/// Driven by every lazy-dialer state change and every pool reload.
/// Grounded in `app.PooledDialer.Track`/`menuet.App().MenuChanged`.
pub trait MenuObserver: Send + Sync {
    fn refresh(&self, status: &PoolStatus);
}

pub struct LoggingMenuObserver;

impl MenuObserver for LoggingMenuObserver {
    fn refresh(&self, status: &PoolStatus) {
        for entry in &status.entries {
            tracing::info!(
                label = %entry.label,
                state = ?entry.state,
                error = entry.error.as_deref(),
                "pool entry status"
            );
        }
    }
}

/// macOS socket activation (`--launchd`, §6): hands back already-open
/// listener sockets by service name instead of binding one directly.
/// Implemented only behind `cfg(target_os = "macos")`; on every other
/// target `--launchd` is rejected as a startup error rather than silently
/// falling back to an explicit bind, matching §6's documented behavior.
pub trait LaunchdActivator: Send + Sync {
    fn sockets(&self, name: &str) -> std::io::Result<Vec<TcpListener>>;
}

pub struct UnsupportedLaunchdActivator;

impl LaunchdActivator for UnsupportedLaunchdActivator {
    fn sockets(&self, _name: &str) -> std::io::Result<Vec<TcpListener>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "launchd socket activation is only available on macOS",
        ))
    }
}
