//! Admin namespace: live captain tracking.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{debug, info};

use super::{authenticate, spawn_writer, status_response, WsQuery};
use crate::app::App;
use crate::auth::Principal;
use crate::notify::ConnectionHandle;
use crate::protocol::{AdminClientEvent, AdminEvent, AdminUserInfo, LocationUpdatePayload};

/// `GET /ws/admin` — staff upgrade; requires tracking access.
pub async fn ws_handler(
    State(app): State<Arc<App>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = match authenticate(&app, &query) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    if !principal.can_track_locations() {
        return status_response(StatusCode::FORBIDDEN, "tracking access required");
    }
    ws.on_upgrade(move |socket| handle_socket(app, principal, socket))
        .into_response()
}

async fn handle_socket(app: Arc<App>, principal: Principal, socket: WebSocket) {
    let admin_id = principal.id.clone();
    let (handle, rx) = ConnectionHandle::new();
    let closed = handle.closed_token();
    app.presence.bind_admin(&admin_id, handle.clone()).await;

    handle
        .send(AdminEvent::AdminConnected {
            user_info: AdminUserInfo {
                id: principal.id.clone(),
                role: principal.role.to_string(),
            },
            stats: app.tracking.stats().await,
        })
        .await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, rx);

    // Sessions opened over this socket, closed with it.
    let mut session_ids: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&app, &principal, &handle, &mut session_ids, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(admin_id = %admin_id, error = %err, "Admin socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    for session_id in session_ids {
        app.tracking.unsubscribe(&session_id).await;
    }
    app.presence.unbind_admin(&admin_id, handle.connection_id()).await;
    handle.close();
    writer.abort();
    info!(admin_id = %admin_id, "Admin socket closed");
}

async fn handle_frame(
    app: &App,
    principal: &Principal,
    handle: &ConnectionHandle,
    session_ids: &mut Vec<String>,
    text: &str,
) {
    let event: AdminClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(admin_id = %principal.id, error = %err, "Unparseable admin frame");
            handle
                .send(AdminEvent::Error {
                    code: "bad_event".to_owned(),
                    message: "unrecognized event".to_owned(),
                })
                .await;
            return;
        }
    };

    match event {
        AdminClientEvent::StartLocationTracking => {
            match app.tracking.subscribe(principal, handle.clone()).await {
                Ok(session_id) => session_ids.push(session_id),
                Err(err) => {
                    handle
                        .send(AdminEvent::Error {
                            code: "tracking_refused".to_owned(),
                            message: err.to_string(),
                        })
                        .await;
                }
            }
        }
        AdminClientEvent::StopLocationTracking => {
            for session_id in session_ids.drain(..) {
                app.tracking.unsubscribe(&session_id).await;
            }
        }
        AdminClientEvent::GetCurrentLocations => {
            let data = app.tracking.current_locations();
            let count = data.len();
            handle
                .send(AdminEvent::CaptainLocationsInitial { data, count })
                .await;
        }
        AdminClientEvent::GetTrackingStats => {
            handle
                .send(AdminEvent::TrackingStats(app.tracking.stats().await))
                .await;
        }
        AdminClientEvent::FocusCaptain { captain_id } => match app.tracking.focus(&captain_id) {
            Some(data) => {
                handle
                    .send(AdminEvent::CaptainLocationUpdate(
                        LocationUpdatePayload::LocationUpdate { data },
                    ))
                    .await;
            }
            None => {
                handle
                    .send(AdminEvent::Error {
                        code: "unknown_captain".to_owned(),
                        message: format!("no position for captain {captain_id}"),
                    })
                    .await;
            }
        },
    }
}
