//! virtd remote management daemon entry point.
//!
//! Loads the configuration, binds the local sockets (and TCP when asked), and
//! serves the remote protocol until interrupted.
//!
//! # Usage
//!
//! ```text
//! virtd [OPTIONS]
//!
//! Options:
//!   --config <PATH>  Configuration file [default: /etc/virtd/virtd.toml]
//!   --listen         Also accept TCP connections
//!   --verbose        Log at debug level unless RUST_LOG says otherwise
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable         | Description                      |
//! |------------------|----------------------------------|
//! | `VIRTD_CONFIG`   | Configuration file path          |
//! | `VIRTD_LISTEN`   | `true` to enable the TCP listener |
//! | `VIRTD_VERBOSE`  | `true` for debug logging         |
//! | `RUST_LOG`       | Full `tracing` filter directive  |
//!
//! The binary serves the in-memory test driver (`test:///default`). Policy
//! checks go through polkit's `pkcheck`. No SASL library is linked in, so a
//! configuration asking for SASL on a listener is refused at startup.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use virtd_daemon::application::auth::AuthNegotiator;
use virtd_daemon::application::dispatch::Dispatcher;
use virtd_daemon::infrastructure::network::server::run_server;
use virtd_daemon::infrastructure::polkit::PkcheckPolicy;
use virtd_daemon::infrastructure::storage::config::{load_config, DaemonConfig, DEFAULT_CONFIG_PATH};
use virtd_daemon::infrastructure::test_driver::TestDriver;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Remote protocol daemon for the virtd management API.
#[derive(Debug, Parser)]
#[command(name = "virtd", about = "Remote management protocol daemon", version)]
struct Cli {
    /// Path of the TOML configuration file. A missing file means defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, env = "VIRTD_CONFIG")]
    config: PathBuf,

    /// Accept TCP connections on the configured address.
    #[arg(long, env = "VIRTD_LISTEN")]
    listen: bool,

    /// Log at debug level.
    #[arg(long, env = "VIRTD_VERBOSE")]
    verbose: bool,
}

impl Cli {
    /// Loads the configuration file and applies the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the result with the overrides applied is invalid.
    fn into_daemon_config(self) -> anyhow::Result<DaemonConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load configuration from {}", self.config.display()))?;
        if self.listen {
            config.listen.listen_tcp = true;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }
        config.validate().context("invalid configuration after command-line overrides")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_daemon_config()?;

    // RUST_LOG wins over the configured level.
    let fallback = config.log_level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .init();

    let allow_list = config
        .auth
        .allow_list()
        .context("invalid sasl_allowed_username_list")?;
    let dispatcher = Dispatcher::new(
        Arc::new(TestDriver::with_default_instances()),
        AuthNegotiator::new(None, Some(Arc::new(PkcheckPolicy::new())), allow_list),
    );

    info!(
        rw = %config.listen.unix_sock_rw.display(),
        ro = %config.listen.unix_sock_ro.display(),
        tcp = config.listen.listen_tcp,
        "virtd starting"
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, dispatcher, running).await?;

    info!("virtd stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
