//! Session Monitor - live view of coding-assistant backend sessions
//!
//! Runs the aggregation engine and logs every change notification;
//! richer presenters (TUI, desktop notifier) attach through the same
//! subscribe/query API.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use session_monitor::cli::Cli;
use session_monitor::config::{self, Config};
use session_monitor::coordinator::Coordinator;
use session_monitor::registry::Notification;
use session_monitor::setup_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // MONITOR_DEBUG=1 wins over the flag.
    let level = if config::debug_enabled() {
        "debug"
    } else {
        &cli.log_level
    };
    if let Err(e) = setup_tracing(level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.discovery.port = port;
            }
            if let Some(secs) = cli.stale_timeout {
                config.aggregator.stale_timeout = Duration::from_secs(secs);
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.discovery.port,
        stale_timeout = ?config.aggregator.stale_timeout,
        notifications = config.notifications.enabled,
        "Starting session monitor"
    );

    let coordinator = Coordinator::new(config);
    if let Err(e) = coordinator.start().await {
        error!("Failed to start aggregator: {e}");
        return ExitCode::FAILURE;
    }

    // Minimal presenter: narrate every change notification.
    let mut subscription = coordinator.subscribe(None);
    let narrator = tokio::spawn(async move {
        while let Some(notification) = subscription.recv().await {
            narrate(&notification);
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }

    coordinator.stop().await;
    narrator.abort();

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

fn narrate(notification: &Notification) {
    match notification {
        Notification::ServerDiscovered { server } => {
            info!(server = %server.id, url = %server.url, name = %server.name, "Discovered");
        }
        Notification::ServerUpdated { server } => {
            info!(server = %server.id, healthy = server.healthy, "Server updated");
        }
        Notification::ServerRemoved { server_id, reason } => {
            info!(server = %server_id, reason = reason.as_str(), "Server removed");
        }
        Notification::SessionAdded { session } => {
            info!(session = %session.id, server = %session.server_id, name = %session.name, "Session added");
        }
        Notification::SessionUpdated { session } => {
            info!(
                session = %session.id,
                status = ?session.status,
                messages = session.messages.len(),
                "Session updated"
            );
        }
        Notification::SessionRemoved {
            session_id,
            server_id,
        } => {
            info!(session = %session_id, server = %server_id, "Session removed");
        }
        Notification::AggregatorError { server_id, message } => {
            warn!(server = ?server_id, "{message}");
        }
        Notification::BacklogDropped { count } => {
            warn!(count, "Notification backlog dropped; view should re-snapshot");
        }
    }
}
