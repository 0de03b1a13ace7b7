//! Fan-out of chat lines to registered sessions.

use crate::protocol::Response;
use crate::registry::Registry;
use crate::session::SessionId;
use std::sync::Arc;
use tracing::{trace, warn};

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the line was written to
    pub delivered: usize,
    /// Sessions whose send failed and were removed from the registry
    pub pruned: Vec<SessionId>,
}

/// Delivers lines to a snapshot of the registry
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Broadcaster { registry }
    }

    /// Send `[sender]: message` to every registered session.
    ///
    /// With `exclude_sender`, members whose nickname equals `sender` are
    /// skipped. Sends happen in join order, one at a time, outside the
    /// registry lock. A failed send never stops delivery to the rest; failed
    /// sessions are unregistered once the pass is done.
    pub async fn broadcast(
        &self,
        sender: &str,
        message: &str,
        exclude_sender: bool,
    ) -> BroadcastReport {
        let line = Response::chat(sender, message);
        let targets = self.registry.snapshot_all();
        let mut report = BroadcastReport::default();

        for member in &targets {
            if exclude_sender && member.nickname == sender {
                continue;
            }
            match member.peer.send(&line).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        session = %member.id(),
                        nickname = %member.nickname,
                        error = %e,
                        "Dropping unreachable peer"
                    );
                    report.pruned.push(member.id());
                }
            }
        }

        for id in &report.pruned {
            self.registry.unregister(*id);
        }

        trace!(
            sender,
            delivered = report.delivered,
            pruned = report.pruned.len(),
            "Broadcast complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Peer;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
    use tokio_test::io::Builder;

    fn duplex_peer(id: u64) -> (Peer, Lines<BufReader<DuplexStream>>) {
        let (client, server) = tokio::io::duplex(1024);
        let peer = Peer::new(SessionId::new(id), server, Duration::from_secs(1));
        (peer, BufReader::new(client).lines())
    }

    #[tokio::test]
    async fn test_exclude_sender() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_rx) = duplex_peer(1);
        let (bob, mut bob_rx) = duplex_peer(2);
        registry.register(&alice, "Alice").unwrap();
        registry.register(&bob, "Bob").unwrap();

        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let report = broadcaster.broadcast("Bob", "hi", true).await;
        assert_eq!(report.delivered, 1);
        assert!(report.pruned.is_empty());

        // Marker line proves nothing else reached Bob before it
        broadcaster.broadcast("SERVER", "marker", false).await;

        assert_eq!(alice_rx.next_line().await.unwrap().as_deref(), Some("[Bob]: hi"));
        assert_eq!(alice_rx.next_line().await.unwrap().as_deref(), Some("[SERVER]: marker"));
        assert_eq!(bob_rx.next_line().await.unwrap().as_deref(), Some("[SERVER]: marker"));
    }

    #[tokio::test]
    async fn test_include_sender() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_rx) = duplex_peer(1);
        registry.register(&alice, "Alice").unwrap();

        let report = Broadcaster::new(Arc::clone(&registry))
            .broadcast("Alice", "echo", false)
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(alice_rx.next_line().await.unwrap().as_deref(), Some("[Alice]: echo"));
    }

    #[tokio::test]
    async fn test_failed_peer_is_pruned_others_still_receive() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_rx) = duplex_peer(1);
        let broken = Peer::new(
            SessionId::new(2),
            Builder::new()
                .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
                .build(),
            Duration::from_secs(1),
        );
        let (carol, mut carol_rx) = duplex_peer(3);

        registry.register(&alice, "Alice").unwrap();
        registry.register(&broken, "Bob").unwrap();
        registry.register(&carol, "Carol").unwrap();

        let report = Broadcaster::new(Arc::clone(&registry))
            .broadcast("SERVER", "hello all", false)
            .await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![SessionId::new(2)]);
        assert_eq!(registry.nicknames(), vec!["Alice", "Carol"]);
        assert!(broken.is_closed());
        assert_eq!(alice_rx.next_line().await.unwrap().as_deref(), Some("[SERVER]: hello all"));
        assert_eq!(carol_rx.next_line().await.unwrap().as_deref(), Some("[SERVER]: hello all"));
    }

    #[tokio::test]
    async fn test_stalled_peer_is_pruned_after_write_timeout() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_rx) = duplex_peer(1);
        // Tiny pipe that is never read: writes stall until the timeout
        let (_stalled_client, stalled_server) = tokio::io::duplex(8);
        let stalled = Peer::new(SessionId::new(2), stalled_server, Duration::from_millis(50));

        registry.register(&alice, "Alice").unwrap();
        registry.register(&stalled, "Slow").unwrap();

        let long_message = "y".repeat(64);
        let report = Broadcaster::new(Arc::clone(&registry))
            .broadcast("SERVER", &long_message, false)
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec![SessionId::new(2)]);
        assert!(stalled.is_closed());
        assert_eq!(registry.nicknames(), vec!["Alice"]);
        assert_eq!(
            alice_rx.next_line().await.unwrap(),
            Some(format!("[SERVER]: {}", long_message))
        );
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = Arc::new(Registry::new());
        let report = Broadcaster::new(registry).broadcast("SERVER", "anyone?", false).await;
        assert_eq!(report, BroadcastReport::default());
    }
}
