//! `diamd`: a Diameter endpoint that logs every message it receives.
//!
//! Binds the configured address (default `0.0.0.0:3868`), registers a
//! catch-all handler plus a monitor for error reports, and runs until
//! SIGINT/SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use diam_server::config::{load_config, DiameterConfig};
use diam_server::lifecycle::{wait_for_signal, Shutdown};
use diam_server::mux::{ErrorReports, CATCH_ALL};
use diam_server::observability::{logging, metrics};
use diam_server::{Conn, Message, ServeMux, Server};

/// How long live connections may keep running after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Short names resolvable by the built-in dictionary.
const KNOWN_COMMANDS: [&str; 8] = ["CE", "DW", "DP", "RA", "ST", "AS", "AC", "CC"];

#[derive(Parser, Debug)]
#[command(name = "diamd", version, about = "Diameter connection and dispatch server")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => DiameterConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "diamd starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mux = Arc::new(ServeMux::new());
    mux.handle_fn(CATCH_ALL, log_message)?;
    for short in KNOWN_COMMANDS {
        mux.handle_fn(format!("{short}R"), log_message)?;
        mux.handle_fn(format!("{short}A"), log_message)?;
    }

    let mut server = Server::from_config(&config).with_handler(mux.clone());
    if let Some(tls) = &config.listener.tls {
        server
            .load_tls(Path::new(&tls.cert_path), Path::new(&tls.key_path))
            .await?;
    }

    if let Some(reports) = server.error_reports() {
        tokio::spawn(monitor_errors(reports));
    }

    let listener = server.bind().await?;
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.trigger();
    });

    server.serve_with_shutdown(listener, shutdown.signalled()).await?;

    if !server.tracker().wait_idle(DRAIN_TIMEOUT).await {
        tracing::warn!(
            active = server.tracker().active_count(),
            "Connections still open after drain timeout"
        );
    }
    tracing::info!(dropped_reports = mux.dropped_reports(), "diamd stopped");
    Ok(())
}

async fn log_message(conn: Conn, message: Arc<Message>) {
    let header = &message.header;
    tracing::info!(
        connection_id = %conn.id(),
        peer_addr = %conn.remote_addr(),
        command = %header.command_name().abbrev,
        request = header.is_request(),
        application_id = header.application_id,
        hop_by_hop_id = header.hop_by_hop_id,
        length = header.message_length,
        "Message received"
    );
}

async fn monitor_errors(reports: ErrorReports) {
    while let Some(report) = reports.recv().await {
        tracing::warn!(
            connection_id = %report.conn.id(),
            peer_addr = %report.conn.remote_addr(),
            error = %report.error,
            "Diameter error"
        );
    }
}
