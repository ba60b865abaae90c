//! Event stream supervision
//!
//! One supervisor per server session owns that server's single event
//! subscription. Decoded events are dispatched to the registry
//! synchronously, in arrival order; if the registry is busy the stream
//! read simply waits, which is the intended backpressure.
//!
//! Reconnects follow `min(base * 2^i, cap)` delays. The attempt counter
//! resets only once a connection is fully established, and when the
//! budget runs out the supervisor parks in `Failed` until its server
//! session is rebuilt by a fresh announcement.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::BackendClient;
use crate::config::StreamConfig;
use crate::registry::Registry;

/// Connection state of one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not yet started, or stopped by cancellation
    Disconnected,
    /// Connection attempt in flight
    Connecting,
    /// Stream established and pumping events
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Attempt budget exhausted; parked until externally rebuilt
    Failed,
}

/// Supervises the long-lived event stream of one backend.
pub struct EventStreamSupervisor {
    server_id: String,
    client: Arc<BackendClient>,
    registry: Arc<Registry>,
    config: StreamConfig,
    state: RwLock<StreamState>,
}

impl EventStreamSupervisor {
    /// Create a supervisor; it does nothing until [`Self::run`] is driven.
    #[must_use]
    pub fn new(
        server_id: String,
        client: Arc<BackendClient>,
        registry: Arc<Registry>,
        config: StreamConfig,
    ) -> Self {
        Self {
            server_id,
            client,
            registry,
            config,
            state: RwLock::new(StreamState::Disconnected),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    fn set_state(&self, next: StreamState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(server = %self.server_id, from = ?*state, to = ?next, "Stream state");
            *state = next;
        }
    }

    /// Run until cancelled or the attempt budget is exhausted.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = self.config.backoff();

        'outer: loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(StreamState::Connecting);
            let connect = tokio::select! {
                () = cancel.cancelled() => break 'outer,
                result = self.client.subscribe() => result,
            };

            match connect {
                Ok(mut stream) => {
                    info!(server = %self.server_id, "Event stream connected");
                    self.set_state(StreamState::Connected);
                    backoff = self.config.backoff();
                    self.registry.set_server_health(&self.server_id, true);

                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break 'outer,
                            event = stream.next_event() => match event {
                                Ok(Some(event)) => {
                                    self.registry.absorb_event(&self.server_id, event);
                                }
                                Ok(None) => {
                                    debug!(server = %self.server_id, "Event stream closed by server");
                                    break;
                                }
                                Err(e) => {
                                    warn!(server = %self.server_id, error = %e, "Event stream error");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(server = %self.server_id, error = %e, "Event stream connect failed");
                }
            }

            match backoff.next() {
                Some(delay) => {
                    self.set_state(StreamState::Reconnecting);
                    debug!(
                        server = %self.server_id,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnect scheduled"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break 'outer,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    warn!(
                        server = %self.server_id,
                        attempts = self.config.max_attempts,
                        "Event stream attempt budget exhausted"
                    );
                    self.set_state(StreamState::Failed);
                    self.registry.set_server_health(&self.server_id, false);
                    self.registry.notify_error(
                        Some(&self.server_id),
                        format!(
                            "event stream to {} failed after {} attempts",
                            self.client.base_url(),
                            self.config.max_attempts
                        ),
                    );
                    return;
                }
            }
        }

        self.set_state(StreamState::Disconnected);
    }
}
