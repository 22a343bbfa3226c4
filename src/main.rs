// Fault Proxy - Main Entry Point
//
// Standalone runner: parses flags, starts the proxy and its control server,
// then waits for /quit, a signal, or the lifetime limit.
//
// Exit codes:
// - 0 orderly quit
// - 1 configuration error
// - 2 startup failure (bind/dial)
// - 3 restart could not bring the proxy back

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fault_proxy::logging::{self, LogFormat};
use fault_proxy::{ExitReason, FaultProxy, ProxyConfig, ProxyError, ProxyMode};
use tracing::{error, info, Level};

/// Controllable fault-injection proxy
#[derive(Parser, Debug)]
#[command(name = "fault-proxy")]
#[command(version)]
#[command(about = "Fault-injection proxy with an HTTP control plane", long_about = None)]
struct Args {
    /// Address to listen on; `host:` picks an ephemeral port
    #[arg(long)]
    listen: Option<String>,

    /// Address of the HTTP control server
    #[arg(long)]
    control: Option<String>,

    /// Backend address to forward to
    #[arg(long)]
    dial: Option<String>,

    /// Proxy raw bytes or HTTP/2 calls
    #[arg(long, value_enum)]
    mode: Option<ProxyMode>,

    /// PEM client certificate presented to the backend (call mode)
    #[arg(long, requires = "client_key")]
    client_cert: Option<PathBuf>,

    /// PEM private key for --client-cert
    #[arg(long, requires = "client_cert")]
    client_key: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Exit after this many seconds; 0 disables the limit
    #[arg(long)]
    max_lifetime_secs: Option<u64>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable trace logging
    #[arg(long)]
    trace: bool,

    /// Log format: compact, pretty or json
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Config file (or defaults), then environment, then flags
    fn into_config(self) -> Result<(ProxyConfig, Level, LogFormat)> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::load_from_path(path)?,
            None => ProxyConfig::default().apply_env_overrides(),
        };

        if let Some(listen) = self.listen {
            config.proxy.listen = listen;
        }
        if let Some(control) = self.control {
            config.control.listen = control;
        }
        if let Some(dial) = self.dial {
            config.proxy.dial = dial;
        }
        if let Some(mode) = self.mode {
            config.proxy.mode = mode;
        }
        if self.client_cert.is_some() {
            config.tls.client_cert = self.client_cert;
            config.tls.client_key = self.client_key;
        }
        if let Some(secs) = self.max_lifetime_secs {
            config.proxy.max_lifetime_secs = secs;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        config.validate()?;

        let level = if self.trace {
            Level::TRACE
        } else if self.verbose {
            Level::DEBUG
        } else {
            config.log_level()?
        };
        let format = config
            .logging
            .format
            .parse::<LogFormat>()
            .map_err(anyhow::Error::msg)
            .context("Invalid logging configuration")?;

        Ok((config, level, format))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let (config, level, format) = match args.into_config() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = logging::init(level, format) {
        eprintln!("fatal: {:#}", e);
        return ExitCode::from(1);
    }

    let grace = config.shutdown_grace();
    let lifetime = config.max_lifetime();

    let proxy = match FaultProxy::start(config).await {
        Ok(proxy) => proxy,
        Err(ProxyError::Config(e)) => {
            error!("invalid configuration: {}", e);
            return ExitCode::from(1);
        }
        Err(e) => {
            error!("failed to start: {}", e);
            return ExitCode::from(2);
        }
    };

    let reason = tokio::select! {
        reason = proxy.wait_exit() => reason,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            ExitReason::Quit
        }
        _ = expire(lifetime) => {
            info!("lifetime of {:?} reached", lifetime.unwrap_or_default());
            ExitReason::Quit
        }
    };

    match reason {
        ExitReason::Quit => {
            proxy.shutdown(grace).await;
            info!("proxy has shut down");
            ExitCode::SUCCESS
        }
        ExitReason::RestartFailed => {
            error!("restart failed, shutting down");
            proxy.close().await;
            ExitCode::from(3)
        }
    }
}

/// Resolves after `lifetime`, or never
async fn expire(lifetime: Option<Duration>) {
    match lifetime {
        Some(lifetime) => tokio::time::sleep(lifetime).await,
        None => std::future::pending().await,
    }
}

/// Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
