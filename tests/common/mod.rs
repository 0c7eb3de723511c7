#![allow(dead_code)]

//! Shared harness for the dispatch integration suites.
//!
//! Builds the full service graph over a scratch sled directory and fakes
//! the transport layer: captains, passengers and admins are "connected" by
//! binding a [`ConnectionHandle`] pair directly into the presence registry,
//! and client events are injected through the same lifecycle service the
//! websocket handlers call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tarhal::app::{build, App};
use tarhal::auth::TokenRegistry;
use tarhal::config::{AppConfig, DispatchSettings};
use tarhal::intake::PassengerRef;
use tarhal::notify::ConnectionHandle;
use tarhal::protocol::{CaptainEvent, OutboundEvent, PassengerEvent, RequestedLocation};
use tarhal::store::{CaptainDirectory, Party, Storage, TransferKind};
use tarhal::types::{CaptainProfile, Trip};

pub struct Rig {
    pub app: Arc<App>,
    pub shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

/// Dispatch settings tuned for fast tests. Range validation is a boundary
/// concern; the harness injects these directly.
pub fn fast_settings() -> DispatchSettings {
    let mut settings = DispatchSettings::default();
    settings.initial_radius_km = 2.0;
    settings.max_radius_km = 2.0;
    settings.radius_increment_km = 1.0;
    settings.notification_timeout_sec = 2;
    settings.max_dispatch_time_sec = 60;
    settings.grace_after_max_radius_sec = 8;
    settings.queue_processing_delay_ms = 1000;
    settings.min_ride_price = 5000;
    settings
}

pub async fn rig(settings: DispatchSettings) -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig::default();
    config.dispatch = settings;

    let storage = Storage::open(dir.path()).expect("storage");
    let shutdown = CancellationToken::new();
    let built = build(&config, storage, Arc::new(TokenRegistry::new()), shutdown.clone())
        .expect("service graph");
    tokio::spawn(built.supervisor.run());
    Rig { app: built.app, shutdown, _dir: dir }
}

/// A fake realtime connection: the events the server pushed, in order.
pub struct TestConnection {
    pub handle: ConnectionHandle,
    pub rx: mpsc::Receiver<OutboundEvent>,
}

impl TestConnection {
    /// Wait (up to `secs`) for the first captain event matching `pred`,
    /// discarding everything else.
    pub async fn wait_captain_event<F>(&mut self, secs: u64, mut pred: F) -> CaptainEvent
    where
        F: FnMut(&CaptainEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for captain event");
            let event = tokio::time::timeout(remaining, self.rx.recv())
                .await
                .expect("timed out waiting for captain event")
                .expect("connection closed");
            if let OutboundEvent::Captain(event) = event {
                if pred(&event) {
                    return event;
                }
            }
        }
    }

    /// Wait (up to `secs`) for the first passenger event matching `pred`.
    pub async fn wait_passenger_event<F>(&mut self, secs: u64, mut pred: F) -> PassengerEvent
    where
        F: FnMut(&PassengerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for passenger event");
            let event = tokio::time::timeout(remaining, self.rx.recv())
                .await
                .expect("timed out waiting for passenger event")
                .expect("connection closed");
            if let OutboundEvent::Passenger(event) = event {
                if pred(&event) {
                    return event;
                }
            }
        }
    }

    /// Drain whatever is queued right now.
    pub fn drain(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn eligible_profile(captain_id: &str) -> CaptainProfile {
    CaptainProfile {
        id: captain_id.to_owned(),
        name: format!("Captain {captain_id}"),
        phone_number: "+9647700000001".to_owned(),
        rating: 4.7,
        is_active: true,
        is_verified: true,
        last_active_at: None,
    }
}

/// Register, fund, connect and position a captain.
pub async fn connect_captain(rig: &Rig, captain_id: &str, lat: f64, lon: f64, wallet: i64) -> TestConnection {
    let directory: &CaptainDirectory = &rig.app.storage.captains;
    directory.upsert(&eligible_profile(captain_id)).expect("profile");
    if wallet > 0 {
        rig.app
            .storage
            .ledger
            .transfer(&Party::external(), &Party::captain(captain_id), wallet, TransferKind::Topup, None)
            .expect("topup");
    }
    let (handle, rx) = ConnectionHandle::new();
    rig.app.presence.bind_captain(captain_id, handle.clone()).await;
    rig.app.location.upsert(captain_id, lat, lon).expect("position");
    let mut conn = TestConnection { handle, rx };
    // connectionEstablished is only sent by the socket layer; nothing to
    // drain here, but keep the call for symmetry with future handshakes.
    let _ = conn.drain();
    conn
}

pub async fn connect_passenger(rig: &Rig, passenger_id: &str) -> TestConnection {
    let (handle, rx) = ConnectionHandle::new();
    rig.app.presence.bind_passenger(passenger_id, handle.clone()).await;
    TestConnection { handle, rx }
}

/// Create a trip whose pickup sits at the given point; the dropoff is far
/// enough that the fare lands on the configured minimum clamp.
pub fn request_trip(rig: &Rig, passenger_id: &str, lat: f64, lon: f64) -> Trip {
    let passenger = PassengerRef {
        id: passenger_id.to_owned(),
        name: Some("Huda".to_owned()),
        phone: Some("+9647700000009".to_owned()),
    };
    let pickup = RequestedLocation { lat, lon, name: Some("Pickup".to_owned()) };
    let dropoff = RequestedLocation { lat: lat + 0.02, lon, name: Some("Dropoff".to_owned()) };
    rig.app
        .intake
        .create_trip(&passenger, &pickup, &dropoff, Some("cash"))
        .expect("trip created")
}

/// Offers land in the captain's pending slot a beat after the `newRide`
/// frame; give the actor that beat before reacting.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
