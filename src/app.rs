//! Client-Verdrahtung: Hub-Verbindung plus Call Session Machine
//!
//! [`CallClient`] meldet sich mit einem signierten Hello am Hub an, leitet
//! eingehende Signaling-Events an die [`CallEngine`] weiter und sendet deren
//! Nachrichten über denselben WebSocket zurück.

use crate::auth::KeyPair;
use crate::call_engine::{
    CallEngine, CallError, IncomingCallOffer, LocalProfile, MediaSource, NegotiatorFactory,
    WebRtcNegotiatorFactory,
};
use crate::config::EngineConfig;
use crate::signaling::{SignalingClient, SignalingError, SignalingEvent, UserId};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Call(#[from] CallError),
}

/// Verbindungsdaten eines Teilnehmers
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub hub_url: String,
    pub user_id: UserId,
    pub profile: LocalProfile,
    pub engine: EngineConfig,
}

// ============================================================================
// CALL CLIENT
// ============================================================================

/// Ein Teilnehmer: Hub-Client, Identität und Call Engine
pub struct CallClient {
    user_id: UserId,
    keypair: Arc<KeyPair>,
    signaling: Arc<SignalingClient>,
    engine: CallEngine,
    online_tx: watch::Sender<Vec<UserId>>,
    /// Token der Event-Schleife der aktuellen Verbindung
    event_loop: Mutex<CancellationToken>,
}

impl CallClient {
    pub fn new(
        options: ClientOptions,
        keypair: Arc<KeyPair>,
        media: Arc<dyn MediaSource>,
        negotiation: Arc<dyn NegotiatorFactory>,
    ) -> Self {
        let signaling = Arc::new(SignalingClient::new(options.hub_url));
        let engine = CallEngine::new(
            options.engine,
            options.profile,
            media,
            negotiation,
            signaling.clone(),
        );
        let (online_tx, _) = watch::channel(Vec::new());

        Self {
            user_id: options.user_id,
            keypair,
            signaling,
            engine,
            online_tx,
            event_loop: Mutex::new(CancellationToken::new()),
        }
    }

    /// Wie [`new`](Self::new), mit webrtc-rs als Negotiation
    pub fn with_webrtc(
        options: ClientOptions,
        keypair: Arc<KeyPair>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let negotiation = Arc::new(WebRtcNegotiatorFactory::new(&options.engine.ice_servers));
        Self::new(options, keypair, media, negotiation)
    }

    /// Verbindet mit dem Hub, meldet sich an und startet die Event-Schleife.
    ///
    /// Eine bereits laufende Schleife wird ersetzt, es dispatcht immer genau eine.
    pub async fn connect(&self) -> Result<UserId, ClientError> {
        // Vor dem Connect abonnieren, damit kein Event verloren geht
        let events = self.signaling.subscribe();
        let token = CancellationToken::new();
        std::mem::replace(&mut *self.event_loop.lock(), token.clone()).cancel();
        self.spawn_event_loop(events, token.clone());

        let hello = self.keypair.hello(&self.user_id);
        let user_id = match self.signaling.connect_and_register(hello).await {
            Ok(user_id) => user_id,
            Err(e) => {
                token.cancel();
                return Err(e.into());
            }
        };
        Arc::clone(&self.signaling).start_heartbeat();

        tracing::info!("Client {} ready", user_id);
        Ok(user_id)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn engine(&self) -> &CallEngine {
        &self.engine
    }

    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Andere angemeldete Teilnehmer (ohne sich selbst)
    pub fn online_users(&self) -> watch::Receiver<Vec<UserId>> {
        self.online_tx.subscribe()
    }

    pub async fn call(&self, peer: UserId) -> Result<(), ClientError> {
        if !self.signaling.is_connected() {
            return Err(SignalingError::NotConnected.into());
        }
        Ok(self.engine.initiate(peer).await?)
    }

    pub async fn accept(&self) -> Result<(), ClientError> {
        Ok(self.engine.accept().await?)
    }

    pub fn reject(&self) -> Result<(), ClientError> {
        Ok(self.engine.reject()?)
    }

    pub fn hang_up(&self) {
        self.engine.end();
    }

    pub fn toggle_mute(&self) -> bool {
        self.engine.toggle_mute()
    }

    /// Beendet einen laufenden Anruf und trennt die Hub-Verbindung
    pub fn disconnect(&self) {
        self.engine.end();
        self.event_loop.lock().cancel();
        self.signaling.disconnect();
    }

    fn spawn_event_loop(
        &self,
        mut events: tokio::sync::broadcast::Receiver<SignalingEvent>,
        shutdown: CancellationToken,
    ) {
        let engine = self.engine.clone();
        let online_tx = self.online_tx.clone();
        let own_id = self.user_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SignalingEvent::OnlineUsers(users)) => {
                            let others = users.into_iter().filter(|u| *u != own_id).collect();
                            online_tx.send_replace(others);
                        }
                        Ok(event) => dispatch(&engine, event).await,
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("Signaling event loop lagged, {} events dropped", n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Signaling event loop stopped");
        });
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.event_loop.lock().cancel();
    }
}

/// Übersetzt ein Signaling-Event in die passende Engine-Operation
pub async fn dispatch(engine: &CallEngine, event: SignalingEvent) {
    match event {
        SignalingEvent::Connected => {
            tracing::info!("Connected to hub");
        }

        SignalingEvent::Disconnected => {
            // Der Medienpfad ist P2P; ein laufender Anruf bleibt bestehen
            tracing::warn!("Disconnected from hub");
        }

        SignalingEvent::Registered { user_id } => {
            tracing::info!("Registered as {}", user_id);
        }

        SignalingEvent::OnlineUsers(users) => {
            tracing::debug!("{} users online", users.len());
        }

        SignalingEvent::IncomingCall {
            caller_id,
            caller_name,
            caller_pic,
            offer,
        } => {
            engine.handle_incoming_offer(IncomingCallOffer {
                caller_id,
                caller_name,
                caller_pic,
                offer,
            });
        }

        SignalingEvent::CallAccepted { from, answer } => {
            if let Err(e) = engine.handle_answer(&from, answer).await {
                tracing::error!("Failed to handle answer: {}", e);
            }
        }

        SignalingEvent::CallRejected { from } => engine.handle_remote_reject(&from),

        SignalingEvent::CallEnded { from } => engine.handle_remote_end(&from),

        SignalingEvent::IceCandidate { from, candidate } => {
            engine.handle_remote_candidate(&from, candidate).await;
        }

        SignalingEvent::Error { code, message } => {
            tracing::error!("Hub reported error {}: {}", code, message);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
