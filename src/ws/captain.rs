//! Captain namespace: location pings and ride responses.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{authenticate, spawn_writer, status_response, WsQuery};
use crate::app::App;
use crate::auth::{Principal, Role};
use crate::notify::{ConnectionHandle, NotifyPort};
use crate::protocol::{CaptainClientEvent, CaptainEvent, PassengerEvent};
use crate::queue::QueuePort;

/// `GET /ws/captain` — authenticated captain upgrade.
pub async fn ws_handler(
    State(app): State<Arc<App>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = match authenticate(&app, &query) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    if principal.role != Role::Captain {
        return status_response(StatusCode::FORBIDDEN, "captain token required");
    }
    ws.on_upgrade(move |socket| handle_socket(app, principal, socket))
        .into_response()
}

async fn handle_socket(app: Arc<App>, principal: Principal, socket: WebSocket) {
    let captain_id = principal.id.clone();
    let (handle, rx) = ConnectionHandle::new();
    let closed = handle.closed_token();
    let session = app.presence.bind_captain(&captain_id, handle.clone()).await;

    // Directory freshness: a connect stamps the captain's activity.
    if let Err(err) = app.storage.captains.touch(&captain_id) {
        debug!(captain_id = %captain_id, error = %err, "Could not stamp captain activity");
    }

    handle
        .send(CaptainEvent::ConnectionEstablished {
            session_id: session.session_id.clone(),
            server_time: Utc::now(),
        })
        .await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, rx);

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&app, &captain_id, &handle, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(captain_id = %captain_id, error = %err, "Captain socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Teardown: presence first so deliveries start failing, then the queue
    // sweep cancels the captain's timers and drops their offers.
    app.presence
        .unbind_captain(&captain_id, handle.connection_id())
        .await;
    app.queue.on_disconnect(&captain_id).await;
    handle.close();
    writer.abort();
    info!(captain_id = %captain_id, "Captain socket closed");
}

async fn handle_frame(app: &App, captain_id: &str, handle: &ConnectionHandle, text: &str) {
    let event: CaptainClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(captain_id = %captain_id, error = %err, "Unparseable captain frame");
            handle
                .send(CaptainEvent::ride_error(None, "bad_event", "unrecognized event"))
                .await;
            return;
        }
    };
    app.presence.touch_captain(captain_id).await;

    match event {
        CaptainClientEvent::UpdateLocation { lat, lon } => {
            update_location(app, captain_id, handle, lat, lon).await;
        }
        CaptainClientEvent::AcceptRide { ride_id } => {
            if let Err(err) = app.lifecycle.accept_ride(captain_id, &ride_id).await {
                warn!(captain_id = %captain_id, ride_id = %ride_id, error = %err, "Accept refused");
                handle
                    .send(CaptainEvent::ride_error(Some(&ride_id), err.code(), &err.to_string()))
                    .await;
            }
        }
        CaptainClientEvent::RejectRide { ride_id, reason } => {
            if let Err(err) = app
                .lifecycle
                .reject_ride(captain_id, &ride_id, reason.as_deref())
                .await
            {
                handle
                    .send(CaptainEvent::ride_error(Some(&ride_id), err.code(), &err.to_string()))
                    .await;
            }
        }
        CaptainClientEvent::CancelRide { ride_id } => {
            if let Err(err) = app.lifecycle.captain_cancel(captain_id, &ride_id).await {
                handle
                    .send(CaptainEvent::ride_error(Some(&ride_id), err.code(), &err.to_string()))
                    .await;
            }
        }
        CaptainClientEvent::Arrived { ride_id } => {
            if let Err(err) = app.lifecycle.mark_arrived(captain_id, &ride_id).await {
                handle
                    .send(CaptainEvent::ride_error(Some(&ride_id), err.code(), &err.to_string()))
                    .await;
            }
        }
        CaptainClientEvent::StartRide { ride_id } => {
            if let Err(err) = app.lifecycle.start_ride(captain_id, &ride_id).await {
                handle
                    .send(CaptainEvent::ride_error(Some(&ride_id), err.code(), &err.to_string()))
                    .await;
            }
        }
        CaptainClientEvent::EndRide { ride_id } => {
            if let Err(err) = app.lifecycle.end_ride(captain_id, &ride_id).await {
                handle
                    .send(CaptainEvent::ride_error(Some(&ride_id), err.code(), &err.to_string()))
                    .await;
            }
        }
        CaptainClientEvent::SubmitPayment { ride_id, received_amount, notes } => {
            if let Some(notes) = notes.as_deref() {
                debug!(ride_id = %ride_id, notes = notes, "Payment notes");
            }
            if let Err(err) = app
                .lifecycle
                .submit_payment(captain_id, &ride_id, received_amount)
                .await
            {
                handle
                    .send(CaptainEvent::ride_error(Some(&ride_id), err.code(), &err.to_string()))
                    .await;
            }
        }
    }
}

/// Location ping: index upsert, tracking fan-out, live-trip forwarding.
async fn update_location(
    app: &App,
    captain_id: &str,
    handle: &ConnectionHandle,
    lat: f64,
    lon: f64,
) {
    match app.location.upsert(captain_id, lat, lon) {
        Ok(_) => {
            if let Some(position) = app.location.position(captain_id) {
                app.tracking.on_location_update(&position).await;
                if let Some(active) = app.lifecycle.active_ride_for(captain_id) {
                    app.notifier
                        .notify_passenger(
                            &active.passenger_id,
                            PassengerEvent::DriverLocationUpdate {
                                lat: position.point.lat,
                                lon: position.point.lon,
                                ts: position.updated_at,
                            },
                        )
                        .await;
                }
            }
        }
        Err(err) => {
            handle
                .send(CaptainEvent::ride_error(None, err.code(), &err.to_string()))
                .await;
        }
    }
}
