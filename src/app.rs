//! Application wiring: build every service once, hand out one shared bundle.
//!
//! `App` is the axum state for both the REST surface and the websocket
//! namespaces. Construction order matters only in that the queue manager
//! and supervisor are spawned tasks; their handles land in the bundle and
//! the join handles go back to the caller for lifecycle management.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::config::{AppConfig, SettingsHandle};
use crate::dispatch::{
    CircuitBreaker, DispatchContext, DispatchSupervisor, InflightRegistry, RideLifecycle,
    SupervisorHandle,
};
use crate::geo::LocationIndex;
use crate::intake::TripIntake;
use crate::notify::{Notifier, NotifyPort};
use crate::payment::PaymentInterlock;
use crate::presence::PresenceRegistry;
use crate::queue::{CaptainQueueManager, QueuePort};
use crate::store::{EligibilityService, Storage, StoreError, TripStore};
use crate::tracking::AdminTrackingHub;

/// Shared service bundle.
pub struct App {
    pub settings: SettingsHandle,
    pub storage: Storage,
    pub trips: Arc<dyn TripStore>,
    pub location: Arc<LocationIndex>,
    pub presence: Arc<PresenceRegistry>,
    pub notifier: Arc<dyn NotifyPort>,
    pub queue: CaptainQueueManager,
    pub eligibility: Arc<EligibilityService>,
    pub payment: Arc<PaymentInterlock>,
    pub inflight: Arc<InflightRegistry>,
    pub lifecycle: Arc<RideLifecycle>,
    pub intake: Arc<TripIntake>,
    pub tracking: Arc<AdminTrackingHub>,
    pub supervisor: SupervisorHandle,
    pub auth: Arc<dyn Authenticator>,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

/// Everything `build` produces: the bundle plus the tasks it had to spawn
/// and the supervisor instance the caller runs.
pub struct BuiltApp {
    pub app: Arc<App>,
    pub supervisor: DispatchSupervisor,
    pub queue_task: JoinHandle<()>,
}

/// Construct the full service graph over an opened [`Storage`].
pub fn build(
    config: &AppConfig,
    storage: Storage,
    auth: Arc<dyn Authenticator>,
    shutdown: CancellationToken,
) -> Result<BuiltApp, StoreError> {
    // Persisted settings override the file on startup.
    let dispatch_settings = storage
        .settings
        .load()?
        .unwrap_or_else(|| config.dispatch.clone());
    let settings = SettingsHandle::new(dispatch_settings);

    let trips: Arc<dyn TripStore> = storage.trips.clone();
    let location = Arc::new(LocationIndex::new());
    let presence = Arc::new(PresenceRegistry::new());
    let notifier: Arc<dyn NotifyPort> = Arc::new(Notifier::new(presence.clone()));
    let eligibility = Arc::new(EligibilityService::new(
        storage.captains.clone(),
        storage.ledger.clone(),
        trips.clone(),
        settings.clone(),
    ));
    let payment = Arc::new(PaymentInterlock::new(storage.ledger.clone(), settings.clone()));
    let tracking = Arc::new(AdminTrackingHub::new(location.clone(), settings.clone()));

    let (queue, queue_task) = CaptainQueueManager::spawn(
        notifier.clone(),
        presence.clone(),
        eligibility.clone(),
        trips.clone(),
        settings.clone(),
        shutdown.clone(),
    );
    let queue_port: Arc<dyn QueuePort> = Arc::new(queue.clone());

    let inflight = Arc::new(InflightRegistry::new());
    let circuit = Arc::new(CircuitBreaker::default());
    let ctx = Arc::new(DispatchContext {
        trips: trips.clone(),
        location: location.clone(),
        presence: presence.clone(),
        notifier: notifier.clone(),
        queue: queue_port.clone(),
        eligibility: eligibility.clone(),
        payment: payment.clone(),
        settings: settings.clone(),
        inflight: inflight.clone(),
        circuit,
        shutdown: shutdown.clone(),
    });
    let (supervisor, supervisor_handle) = DispatchSupervisor::new(ctx);

    let lifecycle = Arc::new(RideLifecycle::new(
        trips.clone(),
        queue_port,
        notifier.clone(),
        payment.clone(),
        eligibility.clone(),
        storage.captains.clone(),
        inflight.clone(),
        supervisor_handle.clone(),
    ));
    lifecycle.restore_active_rides()?;

    let intake = Arc::new(TripIntake::new(
        trips.clone(),
        settings.clone(),
        supervisor_handle.clone(),
    ));

    let app = Arc::new(App {
        settings,
        storage,
        trips,
        location,
        presence,
        notifier,
        queue,
        eligibility,
        payment,
        inflight,
        lifecycle,
        intake,
        tracking,
        supervisor: supervisor_handle,
        auth,
        shutdown,
        started_at: Utc::now(),
    });

    Ok(BuiltApp { app, supervisor, queue_task })
}
