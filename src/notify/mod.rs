//! Outbound event delivery.
//!
//! A [`ConnectionHandle`] is the write side of one live socket: a bounded
//! channel drained by that socket's writer task, plus a cancellation token
//! that tears the socket down. The transport layer owns the socket; every
//! registry only holds handles.
//!
//! Delivery is deliver-once and unreliable by contract: [`Notifier`] returns
//! `false` when the target is offline or its channel is gone, and nothing is
//! retried or buffered server-side — captain unresponsiveness is always
//! handled by the notification timeout path, not by redelivery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::defaults::CONNECTION_BUFFER_SIZE;
use crate::presence::PresenceRegistry;
use crate::protocol::{CaptainEvent, OutboundEvent, PassengerEvent};

// ============================================================================
// Connection handle
// ============================================================================

/// Write handle to one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: String,
    tx: mpsc::Sender<OutboundEvent>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn new() -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        (
            Self {
                connection_id: Uuid::new_v4().to_string(),
                tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an event for this connection. FIFO per connection; returns
    /// false when the connection is gone.
    pub async fn send(&self, event: impl Into<OutboundEvent>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(event.into()).await.is_ok()
    }

    /// Ask the owning socket task to shut the connection down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token the socket task selects on to observe [`close`](Self::close).
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ============================================================================
// Notify port
// ============================================================================

/// Outbound notification seam consumed by the dispatcher and queue manager,
/// so neither ever holds a session object directly.
#[async_trait]
pub trait NotifyPort: Send + Sync {
    /// Deliver to a captain; false if offline or the send failed.
    async fn notify_captain(&self, captain_id: &str, event: CaptainEvent) -> bool;

    /// Deliver to a passenger; false if offline or the send failed.
    async fn notify_passenger(&self, passenger_id: &str, event: PassengerEvent) -> bool;
}

/// Presence-backed notifier.
pub struct Notifier {
    presence: Arc<PresenceRegistry>,
}

impl Notifier {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }
}

#[async_trait]
impl NotifyPort for Notifier {
    async fn notify_captain(&self, captain_id: &str, event: CaptainEvent) -> bool {
        let Some(handle) = self.presence.lookup_captain(captain_id).await else {
            debug!(captain_id = %captain_id, "Captain offline, event dropped");
            return false;
        };
        let delivered = handle.send(event).await;
        if !delivered {
            debug!(captain_id = %captain_id, "Captain connection dead, event dropped");
        }
        delivered
    }

    async fn notify_passenger(&self, passenger_id: &str, event: PassengerEvent) -> bool {
        let Some(handle) = self.presence.lookup_passenger(passenger_id).await else {
            debug!(passenger_id = %passenger_id, "Passenger offline, event dropped");
            return false;
        };
        let delivered = handle.send(event).await;
        if !delivered {
            debug!(passenger_id = %passenger_id, "Passenger connection dead, event dropped");
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_in_fifo_order() {
        let (handle, mut rx) = ConnectionHandle::new();
        assert!(handle.send(CaptainEvent::ConnectionReplaced { reason: "a".into() }).await);
        assert!(handle.send(CaptainEvent::ConnectionReplaced { reason: "b".into() }).await);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let reason = |e: OutboundEvent| match e {
            OutboundEvent::Captain(CaptainEvent::ConnectionReplaced { reason }) => reason,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(reason(first), "a");
        assert_eq!(reason(second), "b");
    }

    #[tokio::test]
    async fn send_fails_after_close_or_drop() {
        let (handle, rx) = ConnectionHandle::new();
        handle.close();
        assert!(!handle.send(CaptainEvent::ConnectionReplaced { reason: "x".into() }).await);
        drop(rx);

        let (handle, rx) = ConnectionHandle::new();
        drop(rx);
        assert!(!handle.send(CaptainEvent::ConnectionReplaced { reason: "x".into() }).await);
    }

    #[tokio::test]
    async fn notifier_returns_false_for_unknown_target() {
        let presence = Arc::new(PresenceRegistry::new());
        let notifier = Notifier::new(presence);
        assert!(
            !notifier
                .notify_captain("ghost", CaptainEvent::ConnectionReplaced { reason: "x".into() })
                .await
        );
    }
}
