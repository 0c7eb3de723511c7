//! Admin live-tracking hub.
//!
//! Permissioned admin sessions subscribe to the captain position stream:
//! a snapshot on subscribe, a `captain_location_update` per position upsert,
//! and a `location_removed` once a captain has been silent for
//! `locationExpirySec`. Session count is capped by `maxTrackingSessions`.
//!
//! The hub owns the staleness policy; the location index itself keeps no
//! TTL. An expiry sweep task prunes silent captains from both the hub's
//! freshness map and the index.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::Principal;
use crate::config::SettingsHandle;
use crate::geo::{CaptainPosition, LocationIndex};
use crate::notify::ConnectionHandle;
use crate::protocol::{AdminEvent, CaptainLocationData, LocationUpdatePayload, TrackingStats};
use crate::types::CaptainId;

/// How often the expiry sweep runs.
const SWEEP_INTERVAL_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("not permitted to track locations")]
    NotPermitted,
    #[error("tracking session limit reached ({0})")]
    SessionLimit(usize),
}

struct TrackingSession {
    session_id: String,
    admin_id: String,
    handle: ConnectionHandle,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, TrackingSession>,
    last_seen: HashMap<CaptainId, DateTime<Utc>>,
}

pub struct AdminTrackingHub {
    inner: RwLock<Inner>,
    location: Arc<LocationIndex>,
    settings: SettingsHandle,
}

fn location_data(position: &CaptainPosition) -> CaptainLocationData {
    CaptainLocationData {
        captain_id: position.captain_id.clone(),
        lat: position.point.lat,
        lon: position.point.lon,
        updated_at: position.updated_at,
    }
}

impl AdminTrackingHub {
    pub fn new(location: Arc<LocationIndex>, settings: SettingsHandle) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            location,
            settings,
        }
    }

    /// Open a tracking session and push the current snapshot to it.
    pub async fn subscribe(
        &self,
        principal: &Principal,
        handle: ConnectionHandle,
    ) -> Result<String, TrackingError> {
        if !principal.can_track_locations() {
            return Err(TrackingError::NotPermitted);
        }
        let max_sessions = self.settings.current().max_tracking_sessions;
        let session_id = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.write().await;
            if inner.sessions.len() >= max_sessions {
                return Err(TrackingError::SessionLimit(max_sessions));
            }
            inner.sessions.insert(
                session_id.clone(),
                TrackingSession {
                    session_id: session_id.clone(),
                    admin_id: principal.id.clone(),
                    handle: handle.clone(),
                },
            );
        }

        let snapshot = self.current_locations();
        let count = snapshot.len();
        handle
            .send(AdminEvent::CaptainLocationsInitial { data: snapshot, count })
            .await;
        info!(
            admin_id = %principal.id,
            session_id = %session_id,
            captains = count,
            "Tracking session opened"
        );
        Ok(session_id)
    }

    pub async fn unsubscribe(&self, session_id: &str) -> bool {
        let removed = self.inner.write().await.sessions.remove(session_id);
        if let Some(session) = &removed {
            info!(admin_id = %session.admin_id, session_id = %session.session_id, "Tracking session closed");
        }
        removed.is_some()
    }

    /// Drop every session owned by an admin (socket teardown).
    pub async fn unsubscribe_admin(&self, admin_id: &str) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.admin_id != admin_id);
        before - inner.sessions.len()
    }

    /// Per-upsert fan-out. Call after the location index took the position.
    pub async fn on_location_update(&self, position: &CaptainPosition) {
        let payload = LocationUpdatePayload::LocationUpdate { data: location_data(position) };
        let mut inner = self.inner.write().await;
        inner
            .last_seen
            .insert(position.captain_id.clone(), position.updated_at);
        Self::fan_out(&mut inner, AdminEvent::CaptainLocationUpdate(payload)).await;
    }

    /// One expiry pass: silent captains are dropped from the hub map and
    /// the index, and subscribers are told.
    pub async fn expire_stale(&self) -> usize {
        let expiry = chrono::Duration::seconds(self.settings.current().location_expiry_sec as i64);
        let cutoff = Utc::now() - expiry;
        let mut inner = self.inner.write().await;
        let expired: Vec<CaptainId> = inner
            .last_seen
            .iter()
            .filter(|(_, seen)| **seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for captain_id in &expired {
            inner.last_seen.remove(captain_id);
            self.location.remove(captain_id);
            debug!(captain_id = %captain_id, "Captain position expired");
            Self::fan_out(
                &mut inner,
                AdminEvent::CaptainLocationUpdate(LocationUpdatePayload::LocationRemoved {
                    captain_id: captain_id.clone(),
                }),
            )
            .await;
        }
        expired.len()
    }

    pub fn current_locations(&self) -> Vec<CaptainLocationData> {
        let mut data: Vec<CaptainLocationData> =
            self.location.all().iter().map(location_data).collect();
        data.sort_by(|a, b| a.captain_id.cmp(&b.captain_id));
        data
    }

    pub fn focus(&self, captain_id: &str) -> Option<CaptainLocationData> {
        self.location.position(captain_id).as_ref().map(location_data)
    }

    pub async fn stats(&self) -> TrackingStats {
        let settings = self.settings.current();
        let inner = self.inner.read().await;
        TrackingStats {
            active_sessions: inner.sessions.len(),
            tracked_captains: self.location.len(),
            max_sessions: settings.max_tracking_sessions,
            location_expiry_sec: settings.location_expiry_sec,
        }
    }

    /// Deliver to every session, pruning the ones whose socket is gone.
    async fn fan_out(inner: &mut Inner, event: AdminEvent) {
        let mut dead = Vec::new();
        for (session_id, session) in &inner.sessions {
            if !session.handle.send(event.clone()).await {
                dead.push(session_id.clone());
            }
        }
        for session_id in dead {
            inner.sessions.remove(&session_id);
            debug!(session_id = %session_id, "Dead tracking session pruned");
        }
    }
}

/// Periodic expiry sweep. Runs until cancelled.
pub async fn run_expiry_sweep(hub: Arc<AdminTrackingHub>, cancel: CancellationToken) {
    info!("Location expiry sweep started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS)) => {}
        }
        let expired = hub.expire_stale().await;
        if expired > 0 {
            debug!(expired = expired, "Expired stale captain positions");
        }
    }
    info!("Location expiry sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::config::DispatchSettings;
    use crate::protocol::OutboundEvent;

    fn admin() -> Principal {
        Principal {
            id: "a1".to_owned(),
            role: Role::Admin,
            name: None,
            phone: None,
            permissions: Vec::new(),
        }
    }

    fn hub() -> (Arc<AdminTrackingHub>, Arc<LocationIndex>, SettingsHandle) {
        let location = Arc::new(LocationIndex::new());
        let settings = SettingsHandle::new(DispatchSettings::default());
        let hub = Arc::new(AdminTrackingHub::new(location.clone(), settings.clone()));
        (hub, location, settings)
    }

    async fn recv_admin(rx: &mut tokio::sync::mpsc::Receiver<OutboundEvent>) -> AdminEvent {
        match rx.recv().await.unwrap() {
            OutboundEvent::Admin(event) => event,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_sends_snapshot_and_updates_flow() {
        let (hub, location, _) = hub();
        location.upsert("c1", 33.3, 44.4).unwrap();

        let (handle, mut rx) = ConnectionHandle::new();
        hub.subscribe(&admin(), handle).await.unwrap();

        match recv_admin(&mut rx).await {
            AdminEvent::CaptainLocationsInitial { count, data } => {
                assert_eq!(count, 1);
                assert_eq!(data[0].captain_id, "c1");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        let position = location.position("c1").unwrap();
        hub.on_location_update(&position).await;
        match recv_admin(&mut rx).await {
            AdminEvent::CaptainLocationUpdate(LocationUpdatePayload::LocationUpdate { data }) => {
                assert_eq!(data.captain_id, "c1");
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_staff_principal_is_refused() {
        let (hub, _, _) = hub();
        let principal = Principal {
            id: "p1".to_owned(),
            role: Role::Customer,
            name: None,
            phone: None,
            permissions: Vec::new(),
        };
        let (handle, _rx) = ConnectionHandle::new();
        assert!(matches!(
            hub.subscribe(&principal, handle).await,
            Err(TrackingError::NotPermitted)
        ));
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let (hub, _, settings) = hub();
        let mut s = DispatchSettings::default();
        s.max_tracking_sessions = 1;
        settings.swap(s);

        let (h1, _rx1) = ConnectionHandle::new();
        hub.subscribe(&admin(), h1).await.unwrap();
        let (h2, _rx2) = ConnectionHandle::new();
        assert!(matches!(
            hub.subscribe(&admin(), h2).await,
            Err(TrackingError::SessionLimit(1))
        ));
    }

    #[tokio::test]
    async fn stale_positions_expire_and_notify() {
        let (hub, location, settings) = hub();
        let mut s = DispatchSettings::default();
        s.location_expiry_sec = 1;
        settings.swap(s);

        location.upsert("c1", 33.3, 44.4).unwrap();
        let position = location.position("c1").unwrap();
        hub.on_location_update(&position).await;

        let (handle, mut rx) = ConnectionHandle::new();
        hub.subscribe(&admin(), handle).await.unwrap();
        let _snapshot = recv_admin(&mut rx).await;

        // Nothing stale yet.
        assert_eq!(hub.expire_stale().await, 0);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(hub.expire_stale().await, 1);
        assert!(location.position("c1").is_none());

        match recv_admin(&mut rx).await {
            AdminEvent::CaptainLocationUpdate(LocationUpdatePayload::LocationRemoved {
                captain_id,
            }) => assert_eq!(captain_id, "c1"),
            other => panic!("expected removal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_admin_drops_all_their_sessions() {
        let (hub, _, _) = hub();
        let (h1, _rx1) = ConnectionHandle::new();
        let (h2, _rx2) = ConnectionHandle::new();
        hub.subscribe(&admin(), h1).await.unwrap();
        hub.subscribe(&admin(), h2).await.unwrap();
        assert_eq!(hub.unsubscribe_admin("a1").await, 2);
        assert_eq!(hub.stats().await.active_sessions, 0);
    }
}
