//! REST surface for operations tooling and trip intake.
//!
//! Endpoints:
//! - `/api/v1/health`, `/api/v1/status` — monitoring
//! - `/api/v1/rides` — create / read trips
//! - `/api/v1/settings` — read / update / validate dispatch settings
//! - `/api/v1/captains` — profile upsert and wallet operations

pub mod envelope;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::App;

/// Assemble the full HTTP router: REST plus the websocket namespaces.
pub fn create_router(app: Arc<App>) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::get_health))
        .route("/status", get(handlers::get_status))
        .route("/rides", post(handlers::create_ride))
        .route("/rides/:id", get(handlers::get_ride))
        .route("/settings", get(handlers::get_settings))
        .route("/settings", post(handlers::update_settings))
        .route("/settings/validate", post(handlers::validate_settings))
        .route("/captains", post(handlers::upsert_captain))
        .route("/captains/:id/wallet", get(handlers::get_wallet))
        .route("/captains/:id/wallet/topup", post(handlers::topup_wallet))
        .with_state(app.clone());

    Router::new()
        .nest("/api/v1", api)
        .merge(crate::ws::routes(app))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
