//! Dispatch load simulation.
//!
//! Spins up the full dispatch engine in-process (no HTTP) with a fleet of
//! synthetic captains behaving like real drivers: they hold positions
//! around a city centre, receive offers over fake connections, and accept
//! or reject after a think delay. A burst of ride requests is then pushed
//! through intake and the run reports terminal dispositions and
//! time-to-accept statistics.
//!
//! # Usage
//! ```bash
//! ./simulate --captains 30 --trips 20 --accept-probability 0.7
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tarhal::app::{build, App};
use tarhal::auth::TokenRegistry;
use tarhal::config::{AppConfig, DispatchSettings};
use tarhal::intake::PassengerRef;
use tarhal::notify::ConnectionHandle;
use tarhal::protocol::{CaptainEvent, OutboundEvent, RequestedLocation};
use tarhal::store::{Party, Storage, TransferKind, TripStore};
use tarhal::types::{CaptainProfile, TripStatus};

// ============================================================================
// Simulation constants
// ============================================================================

/// City centre the fleet orbits (central Baghdad).
const CENTER_LAT: f64 = 33.315;
const CENTER_LON: f64 = 44.366;
/// Fleet spread around the centre, degrees (~5 km).
const SPREAD_DEG: f64 = 0.045;
/// Wallet every synthetic captain starts with (minor units).
const STARTING_WALLET: i64 = 50_000;
/// Poll interval while waiting for trips to settle.
const SETTLE_POLL: Duration = Duration::from_millis(500);

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "simulate")]
#[command(about = "Dispatch load simulation for the Tarhal engine")]
#[command(version)]
struct Args {
    /// Number of synthetic captains
    #[arg(long, default_value = "20", value_parser = clap::value_parser!(u32).range(1..=500))]
    captains: u32,

    /// Number of ride requests to push through intake
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..=1000))]
    trips: u32,

    /// Probability a captain accepts an offer
    #[arg(long, default_value = "0.8")]
    accept_probability: f64,

    /// Captain think time before responding (milliseconds)
    #[arg(long, default_value = "800")]
    response_delay_ms: u64,

    /// Delay between ride requests (milliseconds)
    #[arg(long, default_value = "250")]
    request_interval_ms: u64,

    /// How long to wait for the fleet to settle (seconds)
    #[arg(long, default_value = "90")]
    settle_timeout_secs: u64,

    /// RNG seed for reproducible runs
    #[arg(long, default_value = "7")]
    seed: u64,
}

/// Synthetic captain behaviour: respond to offers with a think delay.
async fn run_captain(
    app: Arc<App>,
    captain_id: String,
    mut rx: tokio::sync::mpsc::Receiver<OutboundEvent>,
    accept_probability: f64,
    think: Duration,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    while let Some(event) = rx.recv().await {
        let OutboundEvent::Captain(CaptainEvent::NewRide(offer)) = event else {
            continue;
        };
        tokio::time::sleep(think).await;
        if rng.gen_bool(accept_probability) {
            match app.lifecycle.accept_ride(&captain_id, &offer.ride_id).await {
                // A busy ride: complete it after a token trip time so the
                // captain becomes eligible again.
                Ok(_) => {
                    let app = app.clone();
                    let captain_id = captain_id.clone();
                    let ride_id = offer.ride_id.clone();
                    let fare = offer.fare;
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        let _ = app.lifecycle.mark_arrived(&captain_id, &ride_id).await;
                        let _ = app.lifecycle.start_ride(&captain_id, &ride_id).await;
                        let _ = app.lifecycle.end_ride(&captain_id, &ride_id).await;
                        let _ = app.lifecycle.submit_payment(&captain_id, &ride_id, fare).await;
                    });
                }
                Err(err) => {
                    info!(captain_id = %captain_id, ride_id = %offer.ride_id, error = %err, "Accept lost");
                }
            }
        } else {
            let _ = app
                .lifecycle
                .reject_ride(&captain_id, &offer.ride_id, Some("simulated_decline"))
                .await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);

    // Scratch store for this run.
    let data_dir = std::env::temp_dir().join(format!("tarhal-sim-{}", std::process::id()));
    let storage = Storage::open(&data_dir)?;

    let mut config = AppConfig::default();
    config.dispatch = DispatchSettings {
        notification_timeout_sec: 5,
        grace_after_max_radius_sec: 10,
        ..DispatchSettings::default()
    };
    let shutdown = CancellationToken::new();
    let built = build(&config, storage, Arc::new(TokenRegistry::new()), shutdown.clone())?;
    let app = built.app.clone();
    tokio::spawn(built.supervisor.run());

    // Fleet setup.
    info!(captains = args.captains, "Deploying synthetic fleet");
    for i in 0..args.captains {
        let captain_id = format!("sim-captain-{i}");
        app.storage.captains.upsert(&CaptainProfile {
            id: captain_id.clone(),
            name: format!("Sim Captain {i}"),
            phone_number: format!("+9647700{i:06}"),
            rating: 3.6 + rng.gen_range(0.0..1.4),
            is_active: true,
            is_verified: true,
            last_active_at: None,
        })?;
        app.storage.ledger.transfer(
            &Party::external(),
            &Party::captain(&captain_id),
            STARTING_WALLET,
            TransferKind::Topup,
            None,
        )?;

        let (handle, rx) = ConnectionHandle::new();
        app.presence.bind_captain(&captain_id, handle).await;
        let lat = CENTER_LAT + rng.gen_range(-SPREAD_DEG..SPREAD_DEG);
        let lon = CENTER_LON + rng.gen_range(-SPREAD_DEG..SPREAD_DEG);
        app.location.upsert(&captain_id, lat, lon)?;

        tokio::spawn(run_captain(
            app.clone(),
            captain_id,
            rx,
            args.accept_probability.clamp(0.0, 1.0),
            Duration::from_millis(args.response_delay_ms),
            args.seed.wrapping_add(u64::from(i)),
        ));
    }

    // Push the request burst through intake.
    info!(trips = args.trips, "Submitting ride requests");
    let mut requested_at: HashMap<String, Instant> = HashMap::new();
    for i in 0..args.trips {
        let passenger = PassengerRef {
            id: format!("sim-passenger-{i}"),
            name: Some(format!("Sim Passenger {i}")),
            phone: Some(format!("+9647800{i:06}")),
        };
        let pickup = RequestedLocation {
            lat: CENTER_LAT + rng.gen_range(-SPREAD_DEG..SPREAD_DEG),
            lon: CENTER_LON + rng.gen_range(-SPREAD_DEG..SPREAD_DEG),
            name: Some("Sim pickup".to_owned()),
        };
        let dropoff = RequestedLocation {
            lat: CENTER_LAT + rng.gen_range(-SPREAD_DEG..SPREAD_DEG),
            lon: CENTER_LON + rng.gen_range(-SPREAD_DEG..SPREAD_DEG),
            name: Some("Sim dropoff".to_owned()),
        };
        match app.intake.create_trip(&passenger, &pickup, &dropoff, Some("cash")) {
            Ok(trip) => {
                requested_at.insert(trip.id, Instant::now());
            }
            Err(err) => warn!(error = %err, "Request refused"),
        }
        tokio::time::sleep(Duration::from_millis(args.request_interval_ms)).await;
    }

    // Wait for every trip to reach a terminal (or stably-owned) status.
    let settle_deadline = Instant::now() + Duration::from_secs(args.settle_timeout_secs);
    let mut accept_latencies: HashMap<String, Duration> = HashMap::new();
    loop {
        let mut outstanding = 0usize;
        for (trip_id, asked) in &requested_at {
            let Some(trip) = app.trips.by_id(trip_id)? else { continue };
            match trip.status {
                TripStatus::Requested => outstanding += 1,
                _ => {
                    if trip.accepted_at.is_some() && !accept_latencies.contains_key(trip_id) {
                        accept_latencies.insert(trip_id.clone(), asked.elapsed());
                    }
                }
            }
        }
        if outstanding == 0 || Instant::now() >= settle_deadline {
            break;
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }

    // Report.
    let mut by_status: HashMap<String, usize> = HashMap::new();
    for trip_id in requested_at.keys() {
        if let Some(trip) = app.trips.by_id(trip_id)? {
            *by_status.entry(trip.status.to_string()).or_default() += 1;
        }
    }
    println!("\n=== Simulation report ===");
    println!("captains:          {}", args.captains);
    println!("trips requested:   {}", args.trips);
    let mut statuses: Vec<_> = by_status.into_iter().collect();
    statuses.sort();
    for (status, count) in statuses {
        println!("  {status:<18} {count}");
    }
    if !accept_latencies.is_empty() {
        let total: Duration = accept_latencies.values().sum();
        let mean = total / accept_latencies.len() as u32;
        println!("mean time-to-accept: {mean:?} over {} trips", accept_latencies.len());
    }
    println!(
        "ledger balance sum:  {} (must be 0)",
        app.storage.ledger.balance_sum()?
    );

    shutdown.cancel();
    let _ = std::fs::remove_dir_all(&data_dir);
    Ok(())
}
