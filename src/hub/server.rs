//! WebSocket-Transport des Presence Hub
//!
//! Pro Verbindung:
//! 1. `Hello` innerhalb der Admission-Frist abwarten und verifizieren
//! 2. `welcome` senden, im Presence Set registrieren
//! 3. Signaling-Nachrichten nach Ziel-Identität weiterleiten
//! 4. Beim Disconnect über den [`PresenceGuard`] austragen

use super::presence::{ConnectionHandle, PresenceHub};
use crate::auth::IdentitySource;
use crate::config::HubConfig;
use crate::signaling::{error_code, ClientMessage, ServerMessage, UserId};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

// ============================================================================
// STATE
// ============================================================================

/// Gemeinsamer Zustand aller Verbindungs-Handler
#[derive(Clone)]
pub struct HubState {
    pub hub: Arc<PresenceHub>,
    pub identity: Arc<dyn IdentitySource>,
    pub admission_timeout: Duration,
    pub shutdown: CancellationToken,
}

impl HubState {
    pub fn new(hub: Arc<PresenceHub>, identity: Arc<dyn IdentitySource>, config: &HubConfig) -> Self {
        Self {
            hub,
            identity,
            admission_timeout: config.admission_timeout,
            shutdown: CancellationToken::new(),
        }
    }
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Startet den Hub auf einem gebundenen Listener bis `state.shutdown`
/// ausgelöst wird
pub async fn serve(listener: TcpListener, state: HubState) -> Result<(), HubError> {
    let shutdown = state.shutdown.clone();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Presence hub listening on {}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(HubError::Serve)
}

async fn health(State(state): State<HubState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "online": state.hub.snapshot().len(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ============================================================================
// CONNECTION LIFECYCLE
// ============================================================================

async fn handle_socket(socket: WebSocket, state: HubState) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match admit_connection(&mut receiver, &state).await {
        Ok(identity) => identity,
        Err(reply) => {
            if let Some(frame) = to_frame(&reply) {
                let _ = sender.send(frame).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    let (handle, mut outbound_rx) = state.hub.connect(identity);
    handle.deliver(ServerMessage::Welcome {
        user_id: handle.identity().clone(),
    });
    let guard = state.hub.admit(handle.clone());

    // Write-Task: Ausgangs-Queue → Socket
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let Some(frame) = to_frame(&msg) else {
                continue;
            };
            if let Err(e) = sender.send(frame).await {
                tracing::debug!("WebSocket send failed: {}", e);
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                tracing::info!("Closing connection of {} (shutdown)", guard.identity());
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &handle, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error for {}: {}", guard.identity(), e);
                    break;
                }
            }
        }
    }

    tracing::info!(
        "Connection {} of {} closed",
        guard.connection_id(),
        guard.identity()
    );
    drop(guard);
    writer.abort();
}

/// Wartet auf das `Hello` und lässt die Identität prüfen
async fn admit_connection(
    receiver: &mut SplitStream<WebSocket>,
    state: &HubState,
) -> Result<UserId, ServerMessage> {
    let first = tokio::time::timeout(state.admission_timeout, next_text(receiver))
        .await
        .map_err(|_| ServerMessage::error(error_code::ADMISSION_TIMEOUT, "No hello received"))?
        .ok_or_else(|| {
            ServerMessage::error(error_code::NOT_ADMITTED, "Connection closed before hello")
        })?;

    match serde_json::from_str::<ClientMessage>(&first) {
        Ok(ClientMessage::Hello(hello)) => state.identity.admit(&hello).await.map_err(|e| {
            tracing::warn!("Admission of {} rejected: {}", hello.user_id, e);
            ServerMessage::error(error_code::ADMISSION_REJECTED, e.to_string())
        }),
        Ok(_) => Err(ServerMessage::error(
            error_code::NOT_ADMITTED,
            "First message must be hello",
        )),
        Err(e) => Err(ServerMessage::error(error_code::MALFORMED, e.to_string())),
    }
}

async fn next_text(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Verarbeitet eine Nachricht einer zugelassenen Verbindung
fn handle_frame(state: &HubState, handle: &ConnectionHandle, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Malformed message from {}: {}", handle.identity(), e);
            handle.deliver(ServerMessage::error(error_code::MALFORMED, e.to_string()));
            return;
        }
    };

    match message {
        ClientMessage::Heartbeat => {
            handle.deliver(ServerMessage::Pong);
        }
        ClientMessage::Hello(_) => {
            tracing::debug!("Ignoring repeated hello from {}", handle.identity());
        }
        signal => {
            if let Some((destination, relayed)) = signal.into_relay(handle.identity()) {
                let outcome = state.hub.route(&destination, relayed);
                tracing::debug!(
                    "Relay {} -> {}: {:?}",
                    handle.identity(),
                    destination,
                    outcome
                );
            }
        }
    }
}

fn to_frame(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            None
        }
    }
}
