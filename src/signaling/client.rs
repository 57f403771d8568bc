//! WebSocket Client für den Presence Hub
//!
//! Verwaltet die WebSocket-Verbindung zum Hub:
//! - Anmeldung per signiertem `Hello`
//! - Heartbeat-Keeping
//! - Event-basierte Kommunikation
//! - Non-blocking Versand für die Call Engine ([`SignalSink`])

use super::messages::*;
use super::SignalSink;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Maximale Wartezeit auf `welcome`
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat-Intervall
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid hub URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to presence hub")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Hub error: {code} - {message}")]
    HubError { code: u16, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Hub
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Anmeldung erfolgreich
    Registered { user_id: UserId },

    /// Neuer Membership-Snapshot
    OnlineUsers(Vec<UserId>),

    /// Eingehender Anruf
    IncomingCall {
        caller_id: UserId,
        caller_name: String,
        caller_pic: Option<String>,
        offer: SessionDescription,
    },

    /// SDP Answer erhalten
    CallAccepted {
        from: UserId,
        answer: SessionDescription,
    },

    /// Anruf abgelehnt
    CallRejected { from: UserId },

    /// Anruf beendet
    CallEnded { from: UserId },

    /// ICE Candidate erhalten
    IceCandidate { from: UserId, candidate: IceCandidate },

    /// Fehler vom Hub
    Error { code: u16, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    /// Zähler pro Verbindungsaufbau; Tasks älterer Verbindungen schweigen
    connection: u64,
    user_id: Option<UserId>,
    online_users: Vec<UserId>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Presence Hub
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Eigene, vom Hub bestätigte Identität
    pub fn user_id(&self) -> Option<UserId> {
        self.state.read().user_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Zuletzt empfangener Membership-Snapshot
    pub fn online_users(&self) -> Vec<UserId> {
        self.state.read().online_users.clone()
    }

    /// Verbindet mit dem Hub und meldet sich mit `hello` an.
    ///
    /// Gibt die vom Hub bestätigte Identität zurück.
    pub async fn connect_and_register(&self, hello: Hello) -> Result<UserId, SignalingError> {
        let ws_url = ws_endpoint(&self.server_url)?;

        tracing::info!("Connecting to presence hub: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);
        let connection = {
            let mut state = self.state.write();
            state.connection += 1;
            state.is_connected = true;
            state.connection
        };

        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für die Registrierungs-Antwort
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<UserId, SignalingError>>(1);

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state, &event_tx, &reg_tx)
                        }
                        Err(e) => tracing::warn!("Unparsable hub message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by hub");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            let current = {
                let mut state = state.write();
                let current = state.connection == connection;
                if current {
                    state.is_connected = false;
                }
                current
            };
            if current {
                let _ = event_tx.send(SignalingEvent::Disconnected);
            }
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.send(ClientMessage::Hello(hello))?;

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(result) => result,
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(REGISTRATION_TIMEOUT) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Trennt die Verbindung; der Write-Task schließt den Socket
    pub fn disconnect(&self) {
        self.tx.write().take();
        let was_connected = {
            let mut state = self.state.write();
            state.connection += 1;
            std::mem::replace(&mut state.is_connected, false)
        };
        if was_connected {
            let _ = self.event_tx.send(SignalingEvent::Disconnected);
        }
    }

    /// Verarbeitet eingehende Hub-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<UserId, SignalingError>>,
    ) {
        let event = match msg {
            ServerMessage::Welcome { user_id } => {
                tracing::info!("Registered as {}", user_id);
                state.write().user_id = Some(user_id.clone());
                let _ = reg_tx.try_send(Ok(user_id.clone()));
                SignalingEvent::Registered { user_id }
            }

            ServerMessage::OnlineUsers { user_ids } => {
                state.write().online_users = user_ids.clone();
                SignalingEvent::OnlineUsers(user_ids)
            }

            ServerMessage::CallIncoming {
                caller_id,
                caller_name,
                caller_pic,
                offer,
            } => SignalingEvent::IncomingCall {
                caller_id,
                caller_name,
                caller_pic,
                offer,
            },

            ServerMessage::CallAccepted { from, answer } => {
                SignalingEvent::CallAccepted { from, answer }
            }

            ServerMessage::CallRejected { from } => SignalingEvent::CallRejected { from },

            ServerMessage::CallEnded { from } => SignalingEvent::CallEnded { from },

            ServerMessage::IceCandidate { from, candidate } => {
                SignalingEvent::IceCandidate { from, candidate }
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Hub error {}: {}", code, message);
                // Fehler vor der Anmeldung beenden das Warten in connect_and_register
                let _ = reg_tx.try_send(Err(SignalingError::HubError {
                    code,
                    message: message.clone(),
                }));
                SignalingEvent::Error { code, message }
            }

            ServerMessage::Pong => return,
        };

        let _ = event_tx.send(event);
    }

    /// Startet einen Heartbeat-Task, solange die Verbindung steht
    pub fn start_heartbeat(self: Arc<Self>) {
        let connection = self.state.read().connection;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                let alive = {
                    let state = self.state.read();
                    state.is_connected && state.connection == connection
                };
                if !alive {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = self.send(ClientMessage::Heartbeat) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }
}

impl SignalSink for SignalingClient {
    /// Serialisiert und legt die Nachricht in die Write-Queue (try_send)
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let guard = self.tx.read();
        let tx = guard.as_ref().ok_or(SignalingError::NotConnected)?;

        let json =
            serde_json::to_string(&message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.try_send(json)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Leitet aus der Hub-URL den WebSocket-Endpunkt ab (`http` → `ws`, `/ws`)
pub fn ws_endpoint(server_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SignalingError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;

    if !url.path().ends_with("/ws") {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================
