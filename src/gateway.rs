//! WebSocket front door for rider apps.
//!
//! Each connection gets a writer task draining its outbound channel; the
//! registry and the lifecycle push into that same channel. The first frame
//! must be `client.hello`, after which every command runs as its own task.

use std::net::SocketAddr;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::AlertError;
use crate::models::alert::GeoPoint;
use crate::models::envelope::{
    ClientAlertRef, ClientCreateAlert, ClientHello, ClientLocation, ClientNearbyAlerts,
    ClientRespond, Envelope, ServerError,
};
use crate::presence::{ConnectionHandle, Outbound};
use crate::processor::location_processor::record_location;
use crate::state::AppState;

const SERVER_ERROR: &str = "server.error";
const SERVER_SUPERSEDED: &str = "server.superseded";

impl ServerError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<AlertError> for ServerError {
    fn from(e: AlertError) -> Self {
        match e {
            AlertError::Persistence(inner) => {
                error!(error = %inner, "Persistence failure while serving command");
                ServerError::new("internal_error", "internal error, try again")
            }
            other => ServerError::new(other.code(), other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::new("bad_request", e.to_string())
    }
}

type Reply = Result<(&'static str, Value), ServerError>;

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!("Gateway listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, state).await {
                warn!(peer = %addr, error = %e, "Connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: AppState,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = ConnectionHandle::new(tx);
    debug!(peer = %addr, conn = %handle.id(), "Connection accepted");

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Failed to encode outbound frame");
                            continue;
                        }
                    };
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = Envelope::new(SERVER_SUPERSEDED, json!({ "reason": reason }));
                    if let Ok(text) = serde_json::to_string(&frame) {
                        let _ = ws_write.send(Message::Text(text)).await;
                    }
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut user_id: Option<String> = None;
    let mut writer_done = false;

    loop {
        // A finished writer means the socket was superseded or is dead;
        // nothing read after that may act on the rider's behalf.
        let msg = tokio::select! {
            biased;
            _ = &mut writer => {
                writer_done = true;
                debug!(peer = %addr, conn = %handle.id(), "Writer finished, closing reader");
                break;
            }
            msg = ws_read.next() => msg,
        };
        let Some(msg) = msg else {
            break;
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = %addr, error = %e, "Read failed");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(msg.to_text()?) {
            Ok(envelope) => envelope,
            Err(e) => {
                send_error(&handle, ServerError::from(e));
                continue;
            }
        };

        let user = match &user_id {
            Some(user) => user.clone(),
            None => match hello(&state, &handle, envelope) {
                Ok(user) => {
                    info!(peer = %addr, rider = %user, "Rider connected");
                    user_id = Some(user);
                    continue;
                }
                Err(e) => {
                    warn!(peer = %addr, code = %e.code, "Handshake rejected");
                    send_error(&handle, e);
                    break;
                }
            },
        };

        let state = state.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            match handle_command(&state, &user, envelope).await {
                Ok((reply_type, payload)) => {
                    handle.send(reply_type, payload);
                }
                Err(e) => send_error(&handle, e),
            }
        });
    }

    if let Some(user) = &user_id {
        if state.presence.unregister(user, &handle) {
            info!(rider = %user, "Rider disconnected");
        }
    }
    // Writer drains what is queued and stops once the last sender is gone.
    drop(handle);
    if !writer_done {
        let _ = writer.await;
    }
    Ok(())
}

fn send_error(handle: &ConnectionHandle, e: ServerError) {
    handle.send(SERVER_ERROR, json!(e));
}

fn payload<T: DeserializeOwned>(envelope: Envelope) -> Result<T, ServerError> {
    Ok(serde_json::from_value(envelope.payload)?)
}

fn hello(
    state: &AppState,
    handle: &ConnectionHandle,
    envelope: Envelope,
) -> Result<String, ServerError> {
    if envelope.message_type != "client.hello" {
        return Err(ServerError::new("hello_required", "expected client.hello"));
    }
    let hello: ClientHello = payload(envelope)?;
    state
        .presence
        .register(&hello.user_id, handle.clone())
        .map_err(|e| ServerError::new("invalid_user_id", e.to_string()))?;

    handle.send(
        "server.welcome",
        json!({
            "userId": hello.user_id,
            "online": state.presence.snapshot(),
            "lastKnownLocation": state.presence.last_known_location(&hello.user_id),
        }),
    );
    Ok(hello.user_id)
}

async fn handle_command(state: &AppState, user: &str, envelope: Envelope) -> Reply {
    let lifecycle = &state.lifecycle;
    let message_type = envelope.message_type.clone();
    match message_type.as_str() {
        "client.heartbeat" => {
            state.presence.touch(user);
            Ok(("server.heartbeat", json!({ "at": Utc::now() })))
        }
        "client.location" => {
            let report: ClientLocation = payload(envelope)?;
            let point = GeoPoint::new(report.lat, report.lon)?;
            let location = record_location(&state.presence, state.store.as_ref(), user, point)
                .await
                .map_err(AlertError::from)?;
            Ok(("server.location", json!({ "location": location })))
        }
        "client.alert.create" => {
            let request: ClientCreateAlert = payload(envelope)?;
            let created = lifecycle.create(user, request.alert).await?;
            Ok((
                "server.alert.created",
                json!({
                    "alert": created.alert,
                    "nearbyRiders": created.dispatch.candidates.len(),
                    "notifiedRiders": created.dispatch.pushed.len(),
                }),
            ))
        }
        "client.alert.respond" => {
            let request: ClientRespond = payload(envelope)?;
            let alert = lifecycle
                .respond(request.alert_id, user, request.message, request.eta_minutes)
                .await?;
            Ok(("server.alert.responded", json!({ "alert": alert })))
        }
        "client.alert.resolve" => {
            let request: ClientAlertRef = payload(envelope)?;
            let alert = lifecycle.resolve(request.alert_id, user).await?;
            Ok(("server.alert.resolved", json!({ "alert": alert })))
        }
        "client.alert.cancel" => {
            let request: ClientAlertRef = payload(envelope)?;
            let alert = lifecycle.cancel(request.alert_id, user).await?;
            Ok(("server.alert.cancelled", json!({ "alert": alert })))
        }
        "client.alerts.nearby" => {
            let request: ClientNearbyAlerts = payload(envelope)?;
            let radius = request
                .radius_meters
                .unwrap_or(lifecycle.policy().dispatch_radius_meters);
            let alerts = lifecycle
                .query_nearby_alerts(GeoPoint { lat: request.lat, lon: request.lon }, radius, user)
                .await?;
            Ok(("server.alerts.nearby", json!({ "alerts": alerts })))
        }
        "client.alerts.mine" => {
            let alerts = lifecycle.open_alerts_for(user).await?;
            Ok(("server.alerts.mine", json!({ "alerts": alerts })))
        }
        "client.presence.who" => Ok((
            "server.presence.who",
            json!({ "online": state.presence.snapshot() }),
        )),
        "client.hello" => Err(ServerError::new("already_identified", "hello already received")),
        other => Err(ServerError::new(
            "unknown_type",
            format!("unsupported message type {}", other),
        )),
    }
}
