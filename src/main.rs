mod pacman;
mod probestack;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "pacman", version, about = "Host-aware proxy dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy dispatcher.
    Proxy(ProxyArgs),
    /// Test whether a hostname matches any configured rule.
    Check(CheckArgs),
}

#[derive(Debug, Parser)]
struct ProxyArgs {
    /// Address to listen on for client connections. Defaults to the
    /// config file's `listen` key, then 127.0.0.1:11078.
    #[arg(long, env = "PACMAN_LISTEN")]
    listen: Option<SocketAddr>,

    /// Address to serve the admin HTTP surface on. Disabled unless set.
    #[arg(long, env = "PACMAN_ADMIN_LISTEN")]
    admin_listen: Option<SocketAddr>,

    /// Path to the config file. If omitted, uses PACMAN_CONFIG, then
    /// ~/.config/pacman/config.yaml, then the OS default config dir.
    #[arg(long, env = "PACMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Consume already-open listener sockets from the platform's
    /// socket-activation API instead of binding --listen directly.
    #[arg(long)]
    launchd: bool,

    /// Tracing verbosity (error, warn, info, debug, trace).
    #[arg(long, env = "PACMAN_VERBOSITY", default_value = "info")]
    verbosity: String,

    /// Log output format.
    #[arg(long, env = "PACMAN_LOG_FORMAT", default_value = "text")]
    log_format: pacman::logging::LogFormat,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    /// Hostname to test against the configured rules.
    host: String,

    #[arg(long, env = "PACMAN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PACMAN_VERBOSITY", default_value = "warn")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Proxy(args) => {
            let _logging = pacman::logging::init(&args.verbosity, args.log_format);
            let result = pacman::app::run(pacman::app::ProxyOptions {
                listen: args.listen,
                admin_listen: args.admin_listen,
                config_path: args.config,
                launchd: args.launchd,
            })
            .await;

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(error = %err, "pacman exited with an error");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Check(args) => {
            let _logging = pacman::logging::init(&args.verbosity, pacman::logging::LogFormat::Text);

            match pacman::app::check(args.config, &args.host).await {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(err) => {
                    tracing::error!(error = %err, "pacman check failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
