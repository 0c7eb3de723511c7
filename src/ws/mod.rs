//! Realtime transport: the three WebSocket namespaces.
//!
//! - `/ws/captain` — drivers: location pings and ride responses
//! - `/ws/customer` — passengers: ride requests and cancellation
//! - `/ws/admin` — staff: live captain tracking
//!
//! Authentication is a `token` query parameter verified by the app's
//! [`Authenticator`](crate::auth::Authenticator) at upgrade time; the
//! namespace additionally checks the principal's role. Each socket gets a
//! bounded outbound channel drained by a writer task; inbound frames are
//! handled in the socket task itself, so per-connection ordering holds in
//! both directions.

pub mod admin;
pub mod captain;
pub mod customer;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::app::App;
use crate::auth::Principal;
use crate::protocol::OutboundEvent;

/// Query parameters of a namespace upgrade.
#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    pub token: Option<String>,
}

pub fn routes(app: Arc<App>) -> Router {
    Router::new()
        .route("/ws/captain", get(captain::ws_handler))
        .route("/ws/customer", get(customer::ws_handler))
        .route("/ws/admin", get(admin::ws_handler))
        .with_state(app)
}

/// Token verification shared by the three namespaces.
pub(crate) fn authenticate(app: &App, query: &WsQuery) -> Result<Principal, Response> {
    let Some(token) = query.token.as_deref() else {
        return Err(status_response(StatusCode::UNAUTHORIZED, "missing token"));
    };
    app.auth
        .authenticate(token)
        .map_err(|_| status_response(StatusCode::UNAUTHORIZED, "invalid token"))
}

pub(crate) fn status_response(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

/// Drain the connection's outbound channel into the socket sink.
pub(crate) fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(error = %err, "Outbound event serialization failed");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}
