//! UDP discovery listener
//!
//! Backends announce themselves with small JSON datagrams; an orderly
//! shutdown sends one last datagram. The listener decodes and validates
//! each packet and forwards it to the coordinator. It keeps no per-sender
//! state: duplicate announcements are deduped downstream by the registry.

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{DiscoveryPacket, decode_datagram};
use crate::{Error, Result};

/// Discovery datagrams are tiny; anything larger is backend misbehavior
/// and gets truncated into a decode failure.
const MAX_DATAGRAM: usize = 8192;

/// Listens for announce/shutdown datagrams on one UDP port.
pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    /// Bind the discovery socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] when the port cannot be bound; fatal to
    /// startup, recoverable anywhere else.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Bind(format!("udp port {port}: {e}")))?;
        info!(port, "Discovery listener bound");
        Ok(Self { socket })
    }

    /// The actually bound port (differs from the requested one when
    /// binding port 0).
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Receive datagrams until cancelled, forwarding valid packets.
    ///
    /// Malformed datagrams are logged and dropped; unknown packet types
    /// are ignored. Neither stops the listener.
    pub async fn run(self, cancel: CancellationToken, tx: mpsc::Sender<DiscoveryPacket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Discovery listener stopped");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => match decode_datagram(&buf[..len]) {
                        Ok(Some(packet)) => {
                            debug!(peer = %peer, server = packet.server_id(), "Discovery packet");
                            if tx.send(packet).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!(peer = %peer, "Unknown discovery packet type ignored");
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "Malformed discovery datagram dropped");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::protocol::{AnnouncePacket, ShutdownPacket, encode_datagram};

    async fn listener_with_sender() -> (u16, mpsc::Receiver<DiscoveryPacket>, CancellationToken, UdpSocket)
    {
        let listener = DiscoveryListener::bind(0).await.unwrap();
        let port = listener.local_port().unwrap();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(listener.run(cancel.clone(), tx));

        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        (port, rx, cancel, sender)
    }

    #[tokio::test]
    async fn forwards_valid_packets() {
        let (port, mut rx, cancel, sender) = listener_with_sender().await;

        let packet = DiscoveryPacket::Announce(AnnouncePacket {
            server_id: "A".into(),
            server_url: "http://localhost:9000".into(),
            server_name: "S1".into(),
            project: None,
            branch: None,
            version: None,
            timestamp: 1000,
        });
        sender
            .send_to(&encode_datagram(&packet).unwrap(), ("127.0.0.1", port))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, packet);

        cancel.cancel();
    }

    #[tokio::test]
    async fn survives_garbage_and_unknown_types() {
        let (port, mut rx, cancel, sender) = listener_with_sender().await;

        sender
            .send_to(b"{{{{ not json", ("127.0.0.1", port))
            .await
            .unwrap();
        sender
            .send_to(br#"{"type":"heartbeat","serverId":"A"}"#, ("127.0.0.1", port))
            .await
            .unwrap();

        // A valid packet after the garbage proves the listener kept going.
        let packet = DiscoveryPacket::Shutdown(ShutdownPacket {
            server_id: "A".into(),
            timestamp: 2000,
        });
        sender
            .send_to(&encode_datagram(&packet).unwrap(), ("127.0.0.1", port))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, packet);

        cancel.cancel();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = DiscoveryListener::bind(0).await.unwrap();
        let port = first.local_port().unwrap();

        match DiscoveryListener::bind(port).await {
            Err(Error::Bind(_)) => {}
            other => panic!("expected bind failure, got {:?}", other.map(|_| "listener")),
        }
    }
}
