//! Captain queue manager: the single-flight notification core.
//!
//! Per captain, at most one *pending* ride offer exists at any instant;
//! further offers arriving while one is pending land in a bounded,
//! priority-aware queue (drop-oldest on overflow). All mutation of a
//! captain's queue state is serialized through one actor task and its
//! command channel, so no locks guard the state itself.
//!
//! Each captain has a single timer slot, cancelled symmetrically to its
//! creation. The slot holds either:
//! - the pending-offer timeout (fires `TimeoutFired`), or
//! - the queue-advance delay after a reject/timeout (fires `ProcessNext`
//!   after `queueProcessingDelayMs`, damping offer thrash).
//!
//! Invariants:
//! - `pending` is at most one per captain.
//! - A trip id never appears twice (pending + queued) for one captain.
//! - Clearing `pending` either advances the queue or leaves the captain
//!   idle; acceptance clears the whole queue because the captain is busy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::QUEUE_AGED_THRESHOLD_SECS;
use crate::config::SettingsHandle;
use crate::notify::NotifyPort;
use crate::presence::PresenceRegistry;
use crate::protocol::{CaptainEvent, RideOffer};
use crate::store::{EligibilityService, TripStore};
use crate::types::{CaptainId, TripStatus};

/// Command channel capacity; senders briefly backpressure past this.
const COMMAND_BUFFER: usize = 1024;

// ============================================================================
// Port & outcomes
// ============================================================================

/// Outcome of offering a ride to a captain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered now; the captain's pending slot holds it.
    Sent,
    /// Captain busy; queued at this 1-based position.
    Queued(usize),
    /// Not delivered and not queued (dead connection at send time).
    Dropped,
}

/// Why a pending offer was cleared without acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Declined,
    Timeout,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declined => write!(f, "declined"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Queue seam consumed by the dispatcher, which never touches captain
/// session state directly.
#[async_trait]
pub trait QueuePort: Send + Sync {
    /// Offer a ride: send now if the captain is idle, else enqueue.
    async fn send_ride(&self, captain_id: &str, offer: RideOffer) -> SendOutcome;

    async fn has_pending(&self, captain_id: &str) -> bool;

    /// Captain accepted `trip_id`. Returns whether it was their pending
    /// offer; clears the entire queue either way the slot matched.
    async fn on_accept(&self, captain_id: &str, trip_id: &str) -> bool;

    /// Captain rejected (or timed out on) `trip_id`. Returns whether it was
    /// their pending offer; only a matching reject advances the queue.
    async fn on_reject(&self, captain_id: &str, trip_id: &str, reason: RejectReason) -> bool;

    /// Captain disconnected: drop pending, queue, and the timer slot.
    async fn on_disconnect(&self, captain_id: &str);
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Send {
        captain_id: CaptainId,
        offer: RideOffer,
        respond: oneshot::Sender<SendOutcome>,
    },
    HasPending {
        captain_id: CaptainId,
        respond: oneshot::Sender<bool>,
    },
    Accept {
        captain_id: CaptainId,
        trip_id: String,
        respond: oneshot::Sender<bool>,
    },
    Reject {
        captain_id: CaptainId,
        trip_id: String,
        reason: RejectReason,
        respond: oneshot::Sender<bool>,
    },
    TimeoutFired {
        captain_id: CaptainId,
        trip_id: String,
    },
    ProcessNext {
        captain_id: CaptainId,
    },
    Disconnect {
        captain_id: CaptainId,
    },
}

/// Cloneable handle to the queue actor.
#[derive(Clone)]
pub struct CaptainQueueManager {
    tx: mpsc::Sender<Command>,
}

impl CaptainQueueManager {
    /// Spawn the actor task and return its handle.
    pub fn spawn(
        notifier: Arc<dyn NotifyPort>,
        presence: Arc<PresenceRegistry>,
        eligibility: Arc<EligibilityService>,
        trips: Arc<dyn TripStore>,
        settings: SettingsHandle,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let worker = QueueWorker {
            rx,
            self_tx: tx.clone(),
            states: HashMap::new(),
            notifier,
            presence,
            eligibility,
            trips,
            settings,
            cancel,
        };
        let task = tokio::spawn(worker.run());
        (Self { tx }, task)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
        fallback: T,
    ) -> T {
        let (respond, rx) = oneshot::channel();
        if self.tx.send(build(respond)).await.is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }
}

#[async_trait]
impl QueuePort for CaptainQueueManager {
    async fn send_ride(&self, captain_id: &str, offer: RideOffer) -> SendOutcome {
        let captain_id = captain_id.to_owned();
        self.request(
            move |respond| Command::Send { captain_id, offer, respond },
            SendOutcome::Dropped,
        )
        .await
    }

    async fn has_pending(&self, captain_id: &str) -> bool {
        let captain_id = captain_id.to_owned();
        self.request(
            move |respond| Command::HasPending { captain_id, respond },
            false,
        )
        .await
    }

    async fn on_accept(&self, captain_id: &str, trip_id: &str) -> bool {
        let captain_id = captain_id.to_owned();
        let trip_id = trip_id.to_owned();
        self.request(
            move |respond| Command::Accept { captain_id, trip_id, respond },
            false,
        )
        .await
    }

    async fn on_reject(&self, captain_id: &str, trip_id: &str, reason: RejectReason) -> bool {
        let captain_id = captain_id.to_owned();
        let trip_id = trip_id.to_owned();
        self.request(
            move |respond| Command::Reject { captain_id, trip_id, reason, respond },
            false,
        )
        .await
    }

    async fn on_disconnect(&self, captain_id: &str) {
        let _ = self
            .tx
            .send(Command::Disconnect { captain_id: captain_id.to_owned() })
            .await;
    }
}

// ============================================================================
// Worker
// ============================================================================

struct PendingRide {
    trip_id: String,
    sent_at: Instant,
    timeout: Duration,
    attempt: u32,
}

struct QueuedRide {
    offer: RideOffer,
    queued_at: Instant,
}

impl QueuedRide {
    /// Advisory priority, evaluated only at pop time. Monotone in fare:
    /// a pricier ride always outranks an otherwise identical one.
    fn priority(&self, now: Instant) -> f64 {
        let age_secs = now.duration_since(self.queued_at).as_secs_f64();
        self.offer.fare as f64 / 1000.0 - self.offer.distance * 2.0 + age_secs * 0.05
    }
}

#[derive(Default)]
struct CaptainQueueState {
    pending: Option<PendingRide>,
    queue: VecDeque<QueuedRide>,
    /// The single per-captain timer slot.
    timer: Option<JoinHandle<()>>,
}

impl CaptainQueueState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_none() && self.queue.is_empty() && self.timer.is_none()
    }

    fn holds_trip(&self, trip_id: &str) -> bool {
        self.pending.as_ref().is_some_and(|p| p.trip_id == trip_id)
            || self.queue.iter().any(|q| q.offer.ride_id == trip_id)
    }
}

struct QueueWorker {
    rx: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    states: HashMap<CaptainId, CaptainQueueState>,
    notifier: Arc<dyn NotifyPort>,
    presence: Arc<PresenceRegistry>,
    eligibility: Arc<EligibilityService>,
    trips: Arc<dyn TripStore>,
    settings: SettingsHandle,
    cancel: CancellationToken,
}

impl QueueWorker {
    async fn run(mut self) {
        info!("Captain queue manager started");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                }
            }
        }
        for state in self.states.values_mut() {
            state.cancel_timer();
        }
        info!("Captain queue manager stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Send { captain_id, offer, respond } => {
                let outcome = self.handle_send(&captain_id, offer).await;
                let _ = respond.send(outcome);
            }
            Command::HasPending { captain_id, respond } => {
                let has = self
                    .states
                    .get(&captain_id)
                    .is_some_and(|s| s.pending.is_some());
                let _ = respond.send(has);
            }
            Command::Accept { captain_id, trip_id, respond } => {
                let matched = self.handle_accept(&captain_id, &trip_id);
                let _ = respond.send(matched);
            }
            Command::Reject { captain_id, trip_id, reason, respond } => {
                let matched = self.handle_reject(&captain_id, &trip_id, reason);
                let _ = respond.send(matched);
            }
            Command::TimeoutFired { captain_id, trip_id } => {
                let matched = self.handle_reject(&captain_id, &trip_id, RejectReason::Timeout);
                if !matched {
                    debug!(captain_id = %captain_id, trip_id = %trip_id, "Stale queue timer ignored");
                }
            }
            Command::ProcessNext { captain_id } => {
                self.process_next(&captain_id).await;
            }
            Command::Disconnect { captain_id } => {
                if let Some(mut state) = self.states.remove(&captain_id) {
                    state.cancel_timer();
                    debug!(
                        captain_id = %captain_id,
                        dropped_pending = state.pending.is_some(),
                        dropped_queued = state.queue.len(),
                        "Captain queue state cleared on disconnect"
                    );
                }
            }
        }
    }

    async fn handle_send(&mut self, captain_id: &str, offer: RideOffer) -> SendOutcome {
        let settings = self.settings.current();
        let state = self.states.entry(captain_id.to_owned()).or_default();

        if state.holds_trip(&offer.ride_id) {
            // The dispatcher's notified-set prevents re-offers; a duplicate
            // here is a retried command, not a second offer.
            return if state
                .pending
                .as_ref()
                .is_some_and(|p| p.trip_id == offer.ride_id)
            {
                SendOutcome::Sent
            } else {
                SendOutcome::Queued(state.queue.len())
            };
        }

        if state.pending.is_some() {
            if state.queue.len() >= settings.max_queue_length {
                if let Some(evicted) = state.queue.pop_front() {
                    warn!(
                        captain_id = %captain_id,
                        evicted_trip = %evicted.offer.ride_id,
                        "Captain queue full, dropping oldest"
                    );
                }
            }
            state.queue.push_back(QueuedRide { offer, queued_at: Instant::now() });
            let position = state.queue.len();
            debug!(captain_id = %captain_id, position = position, "Ride queued behind pending");
            return SendOutcome::Queued(position);
        }

        let trip_id = offer.ride_id.clone();
        let timeout = Duration::from_secs(settings.notification_timeout_sec);
        if !self
            .notifier
            .notify_captain(captain_id, CaptainEvent::NewRide(offer))
            .await
        {
            debug!(captain_id = %captain_id, trip_id = %trip_id, "Offer delivery failed");
            self.drop_if_idle(captain_id);
            return SendOutcome::Dropped;
        }
        self.set_pending(captain_id, trip_id, timeout, 1);
        SendOutcome::Sent
    }

    fn set_pending(&mut self, captain_id: &str, trip_id: String, timeout: Duration, attempt: u32) {
        let timer = self.spawn_timeout(captain_id, &trip_id, timeout);
        let Some(state) = self.states.get_mut(captain_id) else {
            timer.abort();
            return;
        };
        state.cancel_timer();
        state.timer = Some(timer);
        state.pending = Some(PendingRide {
            trip_id: trip_id.clone(),
            sent_at: Instant::now(),
            timeout,
            attempt,
        });
        debug!(
            captain_id = %captain_id,
            trip_id = %trip_id,
            timeout_secs = timeout.as_secs(),
            attempt = attempt,
            "Pending offer set"
        );
    }

    fn spawn_timeout(&self, captain_id: &str, trip_id: &str, timeout: Duration) -> JoinHandle<()> {
        let tx = self.self_tx.clone();
        let captain_id = captain_id.to_owned();
        let trip_id = trip_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::TimeoutFired { captain_id, trip_id }).await;
        })
    }

    fn handle_accept(&mut self, captain_id: &str, trip_id: &str) -> bool {
        let Some(state) = self.states.get_mut(captain_id) else {
            return false;
        };
        let matched = state.pending.as_ref().is_some_and(|p| p.trip_id == trip_id);
        if !matched {
            return false;
        }
        state.cancel_timer();
        state.pending = None;
        let dropped = state.queue.len();
        state.queue.clear();
        self.drop_if_idle(captain_id);
        info!(
            captain_id = %captain_id,
            trip_id = %trip_id,
            dropped_queued = dropped,
            "Pending offer accepted, queue cleared"
        );
        true
    }

    /// Shared by explicit rejects and pending timeouts.
    fn handle_reject(&mut self, captain_id: &str, trip_id: &str, reason: RejectReason) -> bool {
        let settings = self.settings.current();
        let Some(state) = self.states.get_mut(captain_id) else {
            return false;
        };
        let matched = state.pending.as_ref().is_some_and(|p| p.trip_id == trip_id);
        if !matched {
            return false;
        }
        state.cancel_timer();
        if let Some(pending) = state.pending.take() {
            debug!(
                captain_id = %captain_id,
                trip_id = %trip_id,
                reason = %reason,
                waited_secs = pending.sent_at.elapsed().as_secs(),
                window_secs = pending.timeout.as_secs(),
                attempt = pending.attempt,
                queued = state.queue.len(),
                "Pending offer cleared"
            );
        }

        if state.queue.is_empty() {
            self.drop_if_idle(captain_id);
            return true;
        }
        // Damp offer thrash: advance the queue only after the processing
        // delay, using the captain's timer slot.
        let delay = Duration::from_millis(settings.queue_processing_delay_ms);
        let tx = self.self_tx.clone();
        let captain = captain_id.to_owned();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::ProcessNext { captain_id: captain }).await;
        }));
        true
    }

    /// Pop the highest-priority queued ride that is still worth offering.
    async fn process_next(&mut self, captain_id: &str) {
        let settings = self.settings.current();
        loop {
            let Some(state) = self.states.get_mut(captain_id) else {
                return;
            };
            state.timer = None;
            if state.pending.is_some() {
                // A direct send claimed the slot during the advance delay;
                // its own clear will re-schedule us.
                return;
            }
            let now = Instant::now();
            let best = state
                .queue
                .iter()
                .enumerate()
                .max_by(|(ai, a), (bi, b)| {
                    a.priority(now)
                        .total_cmp(&b.priority(now))
                        // Equal priority: earliest insertion wins.
                        .then(bi.cmp(ai))
                })
                .map(|(i, _)| i);
            let Some(index) = best else {
                self.drop_if_idle(captain_id);
                return;
            };
            let Some(item) = state.queue.remove(index) else {
                return;
            };
            let trip_id = item.offer.ride_id.clone();

            // Re-validate at pop time: the world moved while this sat queued.
            let still_requested = matches!(
                self.trips.by_id(&trip_id),
                Ok(Some(trip)) if trip.status == TripStatus::Requested
            );
            if !still_requested {
                debug!(captain_id = %captain_id, trip_id = %trip_id, "Queued ride no longer requested, skipping");
                continue;
            }
            if !self.presence.is_captain_online(captain_id).await {
                debug!(captain_id = %captain_id, "Captain offline, abandoning queue advance");
                self.drop_if_idle(captain_id);
                return;
            }
            if let Err(err) = self.eligibility.check(captain_id) {
                debug!(captain_id = %captain_id, trip_id = %trip_id, reason = %err, "Captain no longer eligible, skipping");
                continue;
            }

            let mut timeout = Duration::from_secs(settings.notification_timeout_sec);
            if now.duration_since(item.queued_at).as_secs() > QUEUE_AGED_THRESHOLD_SECS {
                let stretched = timeout.as_secs_f64() * settings.effective_queue_timeout_multiplier();
                timeout = Duration::from_secs_f64(stretched);
            }
            if !self
                .notifier
                .notify_captain(captain_id, CaptainEvent::NewRide(item.offer))
                .await
            {
                debug!(captain_id = %captain_id, trip_id = %trip_id, "Queued offer delivery failed, trying next");
                continue;
            }
            self.set_pending(captain_id, trip_id, timeout, 2);
            return;
        }
    }

    fn drop_if_idle(&mut self, captain_id: &str) {
        if self.states.get(captain_id).is_some_and(CaptainQueueState::is_idle) {
            self.states.remove(captain_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchSettings;
    use crate::notify::ConnectionHandle;
    use crate::store::{CaptainDirectory, Ledger, MemoryTripStore, Party, TransferKind};
    use crate::types::{CaptainProfile, Fare, Trip, TripLocation};
    use chrono::Utc;
    use std::sync::Mutex;

    /// Notifier that records captain deliveries and can be switched dead.
    struct RecordingNotifier {
        delivered: Mutex<Vec<(String, CaptainEvent)>>,
        alive: std::sync::atomic::AtomicBool,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                alive: std::sync::atomic::AtomicBool::new(true),
            })
        }

        fn sent_ride_ids(&self, captain_id: &str) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(id, e)| match e {
                    CaptainEvent::NewRide(offer) if id == captain_id => {
                        Some(offer.ride_id.clone())
                    }
                    _ => None,
                })
                .collect()
        }

        fn set_alive(&self, alive: bool) {
            self.alive.store(alive, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl NotifyPort for RecordingNotifier {
        async fn notify_captain(&self, captain_id: &str, event: CaptainEvent) -> bool {
            if !self.alive.load(std::sync::atomic::Ordering::SeqCst) {
                return false;
            }
            self.delivered
                .lock()
                .unwrap()
                .push((captain_id.to_owned(), event));
            true
        }

        async fn notify_passenger(
            &self,
            _passenger_id: &str,
            _event: crate::protocol::PassengerEvent,
        ) -> bool {
            true
        }
    }

    struct Rig {
        manager: CaptainQueueManager,
        notifier: Arc<RecordingNotifier>,
        trips: Arc<MemoryTripStore>,
        presence: Arc<PresenceRegistry>,
        settings: SettingsHandle,
        _guards: Vec<ConnectionHandle>,
    }

    fn trip(id: &str) -> Trip {
        Trip {
            id: id.to_owned(),
            passenger_id: "p1".to_owned(),
            passenger_name: None,
            passenger_phone: None,
            driver_id: None,
            pickup: TripLocation { lat: 33.3, lon: 44.4, name: "A".to_owned() },
            dropoff: TripLocation { lat: 33.35, lon: 44.45, name: "B".to_owned() },
            fare: Fare { amount: 5000, currency: "IQD".to_owned() },
            distance_km: 3.0,
            duration_sec: 600,
            status: TripStatus::Requested,
            dispatching: true,
            payment_method: "cash".to_owned(),
            created_at: Utc::now(),
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            ended_at: None,
            dispatch_ended_at: None,
            cancellation_reason: None,
            payment_received: None,
            main_vault_deducted: false,
            main_vault_deduction_amount: None,
        }
    }

    fn offer_for(id: &str, fare: i64) -> RideOffer {
        let mut t = trip(id);
        t.fare.amount = fare;
        RideOffer::from_trip(&t)
    }

    async fn rig(settings: DispatchSettings) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        std::mem::forget(dir);

        let directory = Arc::new(CaptainDirectory::new(db.open_tree("captains").unwrap()));
        let ledger = Arc::new(Ledger::new(
            db.open_tree("accounts").unwrap(),
            db.open_tree("transfers").unwrap(),
            db.open_tree("pending").unwrap(),
        ));
        let trips = Arc::new(MemoryTripStore::new());
        let presence = Arc::new(PresenceRegistry::new());
        let settings = SettingsHandle::new(settings);

        // One eligible captain, online and funded.
        directory
            .upsert(&CaptainProfile {
                id: "c1".to_owned(),
                name: "Ali".to_owned(),
                phone_number: "+964".to_owned(),
                rating: 4.8,
                is_active: true,
                is_verified: true,
                last_active_at: None,
            })
            .unwrap();
        ledger
            .transfer(&Party::external(), &Party::captain("c1"), 10_000, TransferKind::Topup, None)
            .unwrap();
        let (handle, _rx) = ConnectionHandle::new();
        let guard = handle.clone();
        presence.bind_captain("c1", handle).await;
        // Keep the receiver alive for the test duration.
        std::mem::forget(_rx);

        let eligibility = Arc::new(EligibilityService::new(
            directory,
            ledger,
            trips.clone(),
            settings.clone(),
        ));
        let notifier = RecordingNotifier::new();
        let (manager, _task) = CaptainQueueManager::spawn(
            notifier.clone(),
            presence.clone(),
            eligibility,
            trips.clone(),
            settings.clone(),
            CancellationToken::new(),
        );
        Rig { manager, notifier, trips, presence, settings, _guards: vec![guard] }
    }

    fn fast_settings() -> DispatchSettings {
        let mut s = DispatchSettings::default();
        s.notification_timeout_sec = 1;
        s.queue_processing_delay_ms = 1000;
        s
    }

    #[tokio::test]
    async fn idle_captain_gets_offer_immediately() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        let outcome = rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        assert_eq!(outcome, SendOutcome::Sent);
        assert!(rig.manager.has_pending("c1").await);
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1"]);
    }

    #[tokio::test]
    async fn busy_captain_queues_with_position() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.trips.create(&trip("t2")).unwrap();
        rig.trips.create(&trip("t3")).unwrap();
        assert_eq!(rig.manager.send_ride("c1", offer_for("t1", 5000)).await, SendOutcome::Sent);
        assert_eq!(
            rig.manager.send_ride("c1", offer_for("t2", 5000)).await,
            SendOutcome::Queued(1)
        );
        assert_eq!(
            rig.manager.send_ride("c1", offer_for("t3", 5000)).await,
            SendOutcome::Queued(2)
        );
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest() {
        let mut settings = fast_settings();
        settings.max_queue_length = 1;
        let rig = rig(settings).await;
        for id in ["t1", "t2", "t3"] {
            rig.trips.create(&trip(id)).unwrap();
        }
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        assert_eq!(
            rig.manager.send_ride("c1", offer_for("t2", 5000)).await,
            SendOutcome::Queued(1)
        );
        // t2 is evicted; t3 takes the single slot.
        assert_eq!(
            rig.manager.send_ride("c1", offer_for("t3", 5000)).await,
            SendOutcome::Queued(1)
        );

        // Reject the pending; after the advance delay only t3 can be offered.
        rig.manager.on_reject("c1", "t1", RejectReason::Declined).await;
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn accept_clears_pending_and_queue() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.trips.create(&trip("t2")).unwrap();
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 5000)).await;

        assert!(rig.manager.on_accept("c1", "t1").await);
        assert!(!rig.manager.has_pending("c1").await);

        // Queue was cleared: no further offer arrives even past the delay.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1"]);
    }

    #[tokio::test]
    async fn accept_of_non_pending_trip_is_refused() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        assert!(!rig.manager.on_accept("c1", "t9").await);
        assert!(rig.manager.has_pending("c1").await);
    }

    #[tokio::test]
    async fn reject_advances_queue_after_delay() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.trips.create(&trip("t2")).unwrap();
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 5000)).await;

        assert!(rig.manager.on_reject("c1", "t1", RejectReason::Declined).await);
        // Not yet: the processing delay damps thrash.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1"]);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1", "t2"]);
        assert!(rig.manager.has_pending("c1").await);
    }

    #[tokio::test]
    async fn second_reject_does_not_advance_twice() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.trips.create(&trip("t2")).unwrap();
        rig.trips.create(&trip("t3")).unwrap();
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t3", 5000)).await;

        assert!(rig.manager.on_reject("c1", "t1", RejectReason::Declined).await);
        assert!(!rig.manager.on_reject("c1", "t1", RejectReason::Declined).await);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // Exactly one queue advance happened.
        assert_eq!(rig.notifier.sent_ride_ids("c1").len(), 2);
    }

    #[tokio::test]
    async fn pending_times_out_and_queue_advances() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.trips.create(&trip("t2")).unwrap();
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 5000)).await;

        // 1s pending timeout + 1s advance delay.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn queue_pop_skips_trips_no_longer_requested() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        let mut taken = trip("t2");
        taken.status = TripStatus::Accepted;
        taken.driver_id = Some("other".to_owned());
        rig.trips.create(&taken).unwrap();
        rig.trips.create(&trip("t3")).unwrap();

        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 9000)).await;
        rig.manager.send_ride("c1", offer_for("t3", 1000)).await;

        rig.manager.on_reject("c1", "t1", RejectReason::Declined).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // t2 outranks t3 on fare but is already taken, so t3 is offered.
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn higher_fare_pops_first() {
        let rig = rig(fast_settings()).await;
        for id in ["t1", "t2", "t3"] {
            rig.trips.create(&trip(id)).unwrap();
        }
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 2000)).await;
        rig.manager.send_ride("c1", offer_for("t3", 8000)).await;

        rig.manager.on_reject("c1", "t1", RejectReason::Declined).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn disconnect_clears_everything() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.trips.create(&trip("t2")).unwrap();
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 5000)).await;

        rig.manager.on_disconnect("c1").await;
        assert!(!rig.manager.has_pending("c1").await);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        // No timers survived: nothing further was offered.
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1"]);
    }

    #[tokio::test]
    async fn dead_connection_at_send_time_is_dropped() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.notifier.set_alive(false);
        let outcome = rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        assert_eq!(outcome, SendOutcome::Dropped);
        assert!(!rig.manager.has_pending("c1").await);
    }

    #[tokio::test]
    async fn offline_captain_stops_queue_advance() {
        let rig = rig(fast_settings()).await;
        rig.trips.create(&trip("t1")).unwrap();
        rig.trips.create(&trip("t2")).unwrap();
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 5000)).await;

        let handle = rig.presence.lookup_captain("c1").await.unwrap();
        rig.presence.unbind_captain("c1", handle.connection_id()).await;

        rig.manager.on_reject("c1", "t1", RejectReason::Declined).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(rig.notifier.sent_ride_ids("c1"), vec!["t1"]);
    }

    #[tokio::test]
    async fn settings_swap_applies_to_new_offers() {
        let rig = rig(fast_settings()).await;
        let mut next = fast_settings();
        next.max_queue_length = 1;
        rig.settings.swap(next);
        for id in ["t1", "t2", "t3"] {
            rig.trips.create(&trip(id)).unwrap();
        }
        rig.manager.send_ride("c1", offer_for("t1", 5000)).await;
        rig.manager.send_ride("c1", offer_for("t2", 5000)).await;
        assert_eq!(
            rig.manager.send_ride("c1", offer_for("t3", 5000)).await,
            SendOutcome::Queued(1)
        );
    }
}
