//! Customer namespace: ride requests, cancellation, trip progress events.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::{authenticate, spawn_writer, status_response, WsQuery};
use crate::app::App;
use crate::auth::{Principal, Role};
use crate::intake::PassengerRef;
use crate::notify::ConnectionHandle;
use crate::protocol::{CustomerClientEvent, PassengerEvent};

/// `GET /ws/customer` — authenticated passenger upgrade.
pub async fn ws_handler(
    State(app): State<Arc<App>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = match authenticate(&app, &query) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    if principal.role != Role::Customer {
        return status_response(StatusCode::FORBIDDEN, "customer token required");
    }
    ws.on_upgrade(move |socket| handle_socket(app, principal, socket))
        .into_response()
}

async fn handle_socket(app: Arc<App>, principal: Principal, socket: WebSocket) {
    let passenger_id = principal.id.clone();
    let (handle, rx) = ConnectionHandle::new();
    let closed = handle.closed_token();
    app.presence.bind_passenger(&passenger_id, handle.clone()).await;

    handle
        .send(PassengerEvent::ConnectionEstablished {
            session_id: Uuid::new_v4().to_string(),
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
                        handle_frame(&app, &principal, &handle, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(passenger_id = %passenger_id, error = %err, "Customer socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    app.presence
        .unbind_passenger(&passenger_id, handle.connection_id())
        .await;
    handle.close();
    writer.abort();
    info!(passenger_id = %passenger_id, "Customer socket closed");
}

async fn handle_frame(app: &App, principal: &Principal, handle: &ConnectionHandle, text: &str) {
    let event: CustomerClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(passenger_id = %principal.id, error = %err, "Unparseable customer frame");
            handle
                .send(PassengerEvent::RideError {
                    ride_id: None,
                    code: "bad_event".to_owned(),
                    message: "unrecognized event".to_owned(),
                })
                .await;
            return;
        }
    };

    match event {
        CustomerClientEvent::RequestRide { pickup, dropoff, payment_method } => {
            let passenger = PassengerRef {
                id: principal.id.clone(),
                name: principal.name.clone(),
                phone: principal.phone.clone(),
            };
            match app
                .intake
                .create_trip(&passenger, &pickup, &dropoff, payment_method.as_deref())
            {
                Ok(trip) => {
                    handle
                        .send(PassengerEvent::RideRequested {
                            ride_id: trip.id,
                            fare: trip.fare.amount,
                            currency: trip.fare.currency,
                        })
                        .await;
                }
                Err(err) => {
                    handle
                        .send(PassengerEvent::RideError {
                            ride_id: None,
                            code: err.code().to_owned(),
                            message: err.to_string(),
                        })
                        .await;
                }
            }
        }
        CustomerClientEvent::CancelRide { ride_id } => {
            if let Err(err) = app.lifecycle.passenger_cancel(&principal.id, &ride_id).await {
                handle
                    .send(PassengerEvent::RideError {
                        ride_id: Some(ride_id),
                        code: err.code().to_owned(),
                        message: err.to_string(),
                    })
                    .await;
            }
        }
    }
}
