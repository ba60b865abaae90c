//! Session Monitor Library
//!
//! Local aggregator for coding-assistant backend servers: discovers them
//! over UDP, keeps a live merged view of every session they host, streams
//! per-session change notifications, and relays send/abort/permission
//! commands.
//!
//! # Architecture
//!
//! - **Discovery listener**: decodes announce/shutdown datagrams.
//! - **Server session** (per backend): HTTP client, snapshot
//!   reconciliation loop, and an event-stream supervisor with bounded
//!   exponential backoff.
//! - **Registry**: the canonical state store; single-writer mutations,
//!   change notifications in commit order.
//! - **Coordinator**: lifecycle root and the public
//!   query/command/subscribe API presenters (TUI, notifier) build on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod server_session;
pub mod supervisor;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
