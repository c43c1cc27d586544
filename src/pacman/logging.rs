//! Structured logging (§8, ambient): `tracing` + `tracing-subscriber`,
//! grounded in the teacher's `logging.rs` shape, adapted for PACman's
//! single `--verbosity`/`--log-format` flag pair rather than a config
//! block (the CLI is PACman's only source of logging configuration).
//!
//! Like the teacher, the writer side runs through `tracing_appender`'s
//! non-blocking wrapper so a slow stderr (piped to a file, a full tty
//! buffer) never stalls a connection-handling task on a log write. The
//! returned `LoggingRuntime` holds the `WorkerGuard`; dropping it flushes
//! the background writer, so callers must keep it alive for the process
//! lifetime.

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Holds the non-blocking writer's flush guard. Must be kept alive for as
/// long as logging is wanted; dropping it flushes and stops the worker.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Installs the global subscriber. `RUST_LOG` wins over `--verbosity` when
/// set, matching `EnvFilter`'s normal precedence.
pub fn init(verbosity: &str, format: LogFormat) -> LoggingRuntime {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = match verbosity.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        EnvFilter::new(directive)
    });

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);
    let fmt_layer = match format {
        LogFormat::Json => fmt_layer.json().boxed(),
        LogFormat::Text => fmt_layer.boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();

    LoggingRuntime { _guard: guard }
}
