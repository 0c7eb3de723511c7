//! Admin live-tracking over the full service graph.

mod common;

use common::{connect_captain, fast_settings, rig, TestConnection};

use tarhal::auth::{Principal, Role};
use tarhal::notify::ConnectionHandle;
use tarhal::protocol::{AdminEvent, LocationUpdatePayload, OutboundEvent};

fn admin_principal() -> Principal {
    Principal {
        id: "a1".to_owned(),
        role: Role::Admin,
        name: None,
        phone: None,
        permissions: Vec::new(),
    }
}

async fn next_admin_event(conn: &mut TestConnection) -> AdminEvent {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for admin event");
        let event = tokio::time::timeout(remaining, conn.rx.recv())
            .await
            .expect("timed out waiting for admin event")
            .expect("connection closed");
        if let OutboundEvent::Admin(event) = event {
            return event;
        }
    }
}

#[tokio::test]
async fn admin_sees_snapshot_updates_and_expiry() {
    let mut settings = fast_settings();
    settings.location_expiry_sec = 1;
    let rig = rig(settings).await;

    // One captain already on the map before the admin subscribes.
    let _captain = connect_captain(&rig, "ce", 33.320, 44.366, 10_000).await;

    let (handle, rx) = ConnectionHandle::new();
    let mut admin = TestConnection { handle: handle.clone(), rx };
    rig.app
        .tracking
        .subscribe(&admin_principal(), handle)
        .await
        .expect("subscribe");

    match next_admin_event(&mut admin).await {
        AdminEvent::CaptainLocationsInitial { count, data } => {
            assert_eq!(count, 1);
            assert_eq!(data[0].captain_id, "ce");
        }
        other => panic!("expected initial snapshot, got {other:?}"),
    }

    // A location ping reaches the subscription within a tick.
    rig.app.location.upsert("ce", 33.321, 44.367).expect("upsert");
    let position = rig.app.location.position("ce").expect("position");
    rig.app.tracking.on_location_update(&position).await;
    match next_admin_event(&mut admin).await {
        AdminEvent::CaptainLocationUpdate(LocationUpdatePayload::LocationUpdate { data }) => {
            assert_eq!(data.captain_id, "ce");
            assert!((data.lat - 33.321).abs() < 1e-9);
        }
        other => panic!("expected location update, got {other:?}"),
    }

    // Silence past the expiry window removes the captain from the map.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    assert_eq!(rig.app.tracking.expire_stale().await, 1);
    match next_admin_event(&mut admin).await {
        AdminEvent::CaptainLocationUpdate(LocationUpdatePayload::LocationRemoved {
            captain_id,
        }) => assert_eq!(captain_id, "ce"),
        other => panic!("expected removal, got {other:?}"),
    }
    assert!(rig.app.location.position("ce").is_none());

    let stats = rig.app.tracking.stats().await;
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.tracked_captains, 0);
}

#[tokio::test]
async fn captain_role_cannot_subscribe() {
    let rig = rig(fast_settings()).await;
    let principal = Principal {
        id: "c1".to_owned(),
        role: Role::Captain,
        name: None,
        phone: None,
        permissions: Vec::new(),
    };
    let (handle, _rx) = ConnectionHandle::new();
    assert!(rig.app.tracking.subscribe(&principal, handle).await.is_err());
}
