//! REST handlers: health, status, ride intake, settings, wallet ops.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::envelope::{error_response, ApiErrorResponse, ApiResponse};
use crate::app::App;
use crate::config::validation::validate_ranges;
use crate::config::DispatchSettings;
use crate::intake::PassengerRef;
use crate::notify::NotifyPort;
use crate::presence::PresenceCounts;
use crate::protocol::{CaptainEvent, RequestedLocation};
use crate::store::{Party, TransferKind, TripStore};
use crate::types::{CaptainProfile, Trip};

// ============================================================================
// Health & status
// ============================================================================

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_secs: i64,
}

pub async fn get_health(State(app): State<Arc<App>>) -> Response {
    ApiResponse::ok(HealthBody {
        status: "ok",
        uptime_secs: (Utc::now() - app.started_at).num_seconds(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    online: PresenceCounts,
    dispatches_in_flight: usize,
    tracked_captains: usize,
    pending_transfers: usize,
}

pub async fn get_status(State(app): State<Arc<App>>) -> Response {
    let pending_transfers = match app.storage.ledger.pending_transfers() {
        Ok(pending) => pending.len(),
        Err(err) => return ApiErrorResponse::internal(err.to_string()),
    };
    ApiResponse::ok(StatusBody {
        online: app.presence.counts().await,
        dispatches_in_flight: app.inflight.len(),
        tracked_captains: app.location.len(),
        pending_transfers,
    })
}

// ============================================================================
// Rides
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRideRequest {
    pub passenger_id: String,
    #[serde(default)]
    pub passenger_name: Option<String>,
    #[serde(default)]
    pub passenger_phone: Option<String>,
    pub pickup: RequestedLocation,
    pub dropoff: RequestedLocation,
    #[serde(default)]
    pub payment_method: Option<String>,
}

pub async fn create_ride(
    State(app): State<Arc<App>>,
    Json(request): Json<CreateRideRequest>,
) -> Response {
    let passenger = PassengerRef {
        id: request.passenger_id.clone(),
        name: request.passenger_name.clone(),
        phone: request.passenger_phone.clone(),
    };
    match app.intake.create_trip(
        &passenger,
        &request.pickup,
        &request.dropoff,
        request.payment_method.as_deref(),
    ) {
        Ok(trip) => ApiResponse::<Trip>::created(trip),
        Err(err) => error_response(&err),
    }
}

pub async fn get_ride(State(app): State<Arc<App>>, Path(trip_id): Path<String>) -> Response {
    match app.trips.by_id(&trip_id) {
        Ok(Some(trip)) => ApiResponse::ok(trip),
        Ok(None) => ApiErrorResponse::not_found(format!("no trip {trip_id}")),
        Err(err) => ApiErrorResponse::internal(err.to_string()),
    }
}

// ============================================================================
// Settings
// ============================================================================

pub async fn get_settings(State(app): State<Arc<App>>) -> Response {
    ApiResponse::ok(app.settings.current().as_ref().clone())
}

/// Full-replace update: validate, persist, swap, broadcast.
pub async fn update_settings(
    State(app): State<Arc<App>>,
    Json(settings): Json<DispatchSettings>,
) -> Response {
    let violations = validate_ranges(&settings);
    if !violations.is_empty() {
        let detail = violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return ApiErrorResponse::bad_request("config_invalid", detail);
    }
    if let Err(err) = app.storage.settings.save(&settings) {
        return ApiErrorResponse::internal(err.to_string());
    }
    app.settings.swap(settings.clone());

    // Connected captains learn the new dispatch parameters immediately.
    let captains = app.presence.online_captains().await;
    let notified = captains.len();
    for captain_id in captains {
        app.notifier
            .notify_captain(&captain_id, CaptainEvent::SettingsUpdated(settings.clone()))
            .await;
    }
    info!(notified_captains = notified, "Dispatch settings updated");
    ApiResponse::ok(settings)
}

#[derive(Serialize)]
struct ValidateBody {
    valid: bool,
    violations: Vec<String>,
}

pub async fn validate_settings(Json(settings): Json<DispatchSettings>) -> Response {
    let violations: Vec<String> = validate_ranges(&settings)
        .iter()
        .map(ToString::to_string)
        .collect();
    ApiResponse::ok(ValidateBody { valid: violations.is_empty(), violations })
}

// ============================================================================
// Captains & wallets
// ============================================================================

pub async fn upsert_captain(
    State(app): State<Arc<App>>,
    Json(profile): Json<CaptainProfile>,
) -> Response {
    match app.storage.captains.upsert(&profile) {
        Ok(()) => ApiResponse::ok(profile),
        Err(err) => ApiErrorResponse::internal(err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct TopupRequest {
    pub amount: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WalletBody {
    captain_id: String,
    balance: i64,
}

pub async fn topup_wallet(
    State(app): State<Arc<App>>,
    Path(captain_id): Path<String>,
    Json(request): Json<TopupRequest>,
) -> Response {
    if request.amount <= 0 {
        return ApiErrorResponse::bad_request("invalid_amount", "top-up must be positive");
    }
    let transfer = app.storage.ledger.transfer(
        &Party::external(),
        &Party::captain(&captain_id),
        request.amount,
        TransferKind::Topup,
        None,
    );
    if let Err(err) = transfer {
        warn!(captain_id = %captain_id, error = %err, "Top-up failed");
        return ApiErrorResponse::internal(err.to_string());
    }
    match app.storage.ledger.balance(&Party::captain(&captain_id)) {
        Ok(balance) => ApiResponse::ok(WalletBody { captain_id, balance }),
        Err(err) => ApiErrorResponse::internal(err.to_string()),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WalletDetailBody {
    captain_id: String,
    balance: i64,
    transactions: Vec<crate::store::ledger::TransactionEntry>,
}

pub async fn get_wallet(State(app): State<Arc<App>>, Path(captain_id): Path<String>) -> Response {
    let party = Party::captain(&captain_id);
    let balance = match app.storage.ledger.balance(&party) {
        Ok(balance) => balance,
        Err(err) => return ApiErrorResponse::internal(err.to_string()),
    };
    match app.storage.ledger.history(&party) {
        Ok(transactions) => ApiResponse::ok(WalletDetailBody { captain_id, balance, transactions }),
        Err(err) => ApiErrorResponse::internal(err.to_string()),
    }
}
