//! Presence registry: who is connected right now.
//!
//! Maps captain/passenger/admin ids to their live [`ConnectionHandle`]s.
//! Connections are owned by the transport layer; the registry only holds
//! handles and never outlives them — a dead handle simply fails to deliver.
//!
//! Duplicate captain binds (a phone reconnecting before the old socket
//! noticed) send `connectionReplaced` to the previous connection and close
//! it before the new one takes the slot. Closed captain sessions are
//! retained for 30 seconds for analytics.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::defaults::SESSION_RETENTION_SECS;
use crate::notify::ConnectionHandle;
use crate::protocol::CaptainEvent;
use crate::types::{AdminId, CaptainId, CaptainSession, PassengerId};

/// A closed captain session kept briefly for analytics.
#[derive(Debug, Clone)]
struct RetainedSession {
    session: CaptainSession,
    closed_at: Instant,
}

#[derive(Default)]
struct Inner {
    captains: HashMap<CaptainId, ConnectionHandle>,
    captain_sessions: HashMap<CaptainId, CaptainSession>,
    passengers: HashMap<PassengerId, ConnectionHandle>,
    admins: HashMap<AdminId, ConnectionHandle>,
    retained: Vec<RetainedSession>,
}

/// Online counts for the status endpoint.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceCounts {
    pub captains: usize,
    pub passengers: usize,
    pub admins: usize,
}

#[derive(Default)]
pub struct PresenceRegistry {
    inner: RwLock<Inner>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Captains
    // ------------------------------------------------------------------

    /// Bind a captain connection, replacing (and notifying) any previous
    /// one. Returns the new session record.
    pub async fn bind_captain(
        &self,
        captain_id: &str,
        handle: ConnectionHandle,
    ) -> CaptainSession {
        let session = CaptainSession::new(captain_id, &Uuid::new_v4().to_string());
        let replaced = {
            let mut inner = self.inner.write().await;
            let replaced = inner.captains.insert(captain_id.to_owned(), handle);
            if let Some(old_session) = inner
                .captain_sessions
                .insert(captain_id.to_owned(), session.clone())
            {
                inner.retained.push(RetainedSession {
                    session: old_session,
                    closed_at: Instant::now(),
                });
            }
            prune_retained(&mut inner);
            replaced
        };

        match replaced {
            // Outside the lock: tell the old socket why it is going away.
            Some(old) => {
                info!(captain_id = %captain_id, "Captain reconnected, replacing previous connection");
                old.send(CaptainEvent::ConnectionReplaced {
                    reason: "newer_connection".to_owned(),
                })
                .await;
                old.close();
            }
            None => info!(captain_id = %captain_id, "Captain connected"),
        }
        session
    }

    /// Remove a captain binding, but only if it still belongs to the given
    /// connection — a replaced socket's late disconnect must not evict its
    /// successor.
    pub async fn unbind_captain(&self, captain_id: &str, connection_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let matches = inner
            .captains
            .get(captain_id)
            .is_some_and(|h| h.connection_id() == connection_id);
        if !matches {
            return false;
        }
        inner.captains.remove(captain_id);
        if let Some(session) = inner.captain_sessions.remove(captain_id) {
            inner.retained.push(RetainedSession {
                session,
                closed_at: Instant::now(),
            });
        }
        prune_retained(&mut inner);
        debug!(captain_id = %captain_id, "Captain disconnected");
        true
    }

    pub async fn lookup_captain(&self, captain_id: &str) -> Option<ConnectionHandle> {
        self.inner.read().await.captains.get(captain_id).cloned()
    }

    pub async fn is_captain_online(&self, captain_id: &str) -> bool {
        self.inner.read().await.captains.contains_key(captain_id)
    }

    /// Stamp activity on a captain's session.
    pub async fn touch_captain(&self, captain_id: &str) {
        if let Some(session) = self
            .inner
            .write()
            .await
            .captain_sessions
            .get_mut(captain_id)
        {
            session.touch();
        }
    }

    /// Every online captain id (settings broadcast fan-out).
    pub async fn online_captains(&self) -> Vec<CaptainId> {
        self.inner.read().await.captains.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Passengers
    // ------------------------------------------------------------------

    pub async fn bind_passenger(&self, passenger_id: &str, handle: ConnectionHandle) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.passengers.insert(passenger_id.to_owned(), handle) {
            old.close();
        }
        info!(passenger_id = %passenger_id, "Passenger connected");
    }

    pub async fn unbind_passenger(&self, passenger_id: &str, connection_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let matches = inner
            .passengers
            .get(passenger_id)
            .is_some_and(|h| h.connection_id() == connection_id);
        if matches {
            inner.passengers.remove(passenger_id);
        }
        matches
    }

    pub async fn lookup_passenger(&self, passenger_id: &str) -> Option<ConnectionHandle> {
        self.inner.read().await.passengers.get(passenger_id).cloned()
    }

    pub async fn is_passenger_online(&self, passenger_id: &str) -> bool {
        self.inner.read().await.passengers.contains_key(passenger_id)
    }

    // ------------------------------------------------------------------
    // Admins
    // ------------------------------------------------------------------

    pub async fn bind_admin(&self, admin_id: &str, handle: ConnectionHandle) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.admins.insert(admin_id.to_owned(), handle) {
            old.close();
        }
        info!(admin_id = %admin_id, "Admin connected");
    }

    pub async fn unbind_admin(&self, admin_id: &str, connection_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let matches = inner
            .admins
            .get(admin_id)
            .is_some_and(|h| h.connection_id() == connection_id);
        if matches {
            inner.admins.remove(admin_id);
        }
        matches
    }

    pub async fn lookup_admin(&self, admin_id: &str) -> Option<ConnectionHandle> {
        self.inner.read().await.admins.get(admin_id).cloned()
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub async fn counts(&self) -> PresenceCounts {
        let inner = self.inner.read().await;
        PresenceCounts {
            captains: inner.captains.len(),
            passengers: inner.passengers.len(),
            admins: inner.admins.len(),
        }
    }
}

fn prune_retained(inner: &mut Inner) {
    let cutoff = std::time::Duration::from_secs(SESSION_RETENTION_SECS);
    inner.retained.retain(|r| r.closed_at.elapsed() < cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundEvent;

    #[tokio::test]
    async fn duplicate_bind_replaces_and_notifies_old_connection() {
        let registry = PresenceRegistry::new();
        let (old, mut old_rx) = ConnectionHandle::new();
        let (new, _new_rx) = ConnectionHandle::new();

        registry.bind_captain("c1", old.clone()).await;
        registry.bind_captain("c1", new.clone()).await;

        let event = old_rx.recv().await.unwrap();
        assert!(matches!(
            event,
            OutboundEvent::Captain(CaptainEvent::ConnectionReplaced { .. })
        ));
        assert!(old.is_closed());

        let current = registry.lookup_captain("c1").await.unwrap();
        assert_eq!(current.connection_id(), new.connection_id());
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_evict_successor() {
        let registry = PresenceRegistry::new();
        let (old, _rx1) = ConnectionHandle::new();
        let (new, _rx2) = ConnectionHandle::new();
        registry.bind_captain("c1", old.clone()).await;
        registry.bind_captain("c1", new.clone()).await;

        // The replaced socket's handler finally runs its cleanup.
        assert!(!registry.unbind_captain("c1", old.connection_id()).await);
        assert!(registry.is_captain_online("c1").await);

        assert!(registry.unbind_captain("c1", new.connection_id()).await);
        assert!(!registry.is_captain_online("c1").await);
    }

    #[tokio::test]
    async fn counts_reflect_bindings() {
        let registry = PresenceRegistry::new();
        let (c, _rx1) = ConnectionHandle::new();
        let (p, _rx2) = ConnectionHandle::new();
        registry.bind_captain("c1", c).await;
        registry.bind_passenger("p1", p).await;
        let counts = registry.counts().await;
        assert_eq!(counts.captains, 1);
        assert_eq!(counts.passengers, 1);
        assert_eq!(counts.admins, 0);
    }
}
