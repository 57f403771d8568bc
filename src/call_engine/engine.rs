//! Call Session Machine
//!
//! Verwaltet den Lebenszyklus genau eines Anrufs pro Teilnehmer:
//! `Idle → Initiating → Ringing | Incoming → Negotiating → Connected → Ended`.
//!
//! Der gesamte Session-Zustand liegt hinter einem Mutex; jede Transition
//! wird dort atomar geprüft und angewendet. Nach jedem `await` (Mikrofon,
//! SDP) prüft die Engine die Epoche der Session: wurde der Anruf in der
//! Zwischenzeit beendet, wird das Ergebnis verworfen und freigegeben.
//! Alle Beendigungspfade laufen über denselben idempotenten Teardown.

use super::media::{LocalStream, MediaError, MediaSource, RemoteStream};
use super::negotiation::{
    ConnectivityState, NegotiationError, NegotiationEvent, NegotiationEventHandler, Negotiator,
    NegotiatorFactory,
};
use crate::config::EngineConfig;
use crate::signaling::{ClientMessage, IceCandidate, SessionDescription, SignalSink, UserId};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Microphone access denied")]
    MediaDenied,

    #[error("Microphone unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Peer did not answer")]
    PeerUnreachable,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Call ended while the operation was in progress")]
    Cancelled,
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied => CallError::MediaDenied,
            MediaError::Unavailable(reason) => CallError::MediaUnavailable(reason),
        }
    }
}

impl From<NegotiationError> for CallError {
    fn from(e: NegotiationError) -> Self {
        CallError::NegotiationFailed(e.to_string())
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Kein Anruf
    Idle,
    /// Mikrofon und Offer werden vorbereitet
    Initiating { peer: UserId },
    /// Offer gesendet, warte auf Antwort
    Ringing { peer: UserId },
    /// Eingehendes Angebot wartet auf Entscheidung
    Incoming { peer: UserId, caller_name: String },
    /// Offer/Answer ausgetauscht, ICE läuft
    Negotiating { peer: UserId },
    /// Verbindung steht
    Connected { peer: UserId },
    /// Anruf beendet, alle Ressourcen freigegeben
    Ended,
}

impl CallState {
    pub fn peer(&self) -> Option<&UserId> {
        match self {
            CallState::Initiating { peer }
            | CallState::Ringing { peer }
            | CallState::Incoming { peer, .. }
            | CallState::Negotiating { peer }
            | CallState::Connected { peer } => Some(peer),
            CallState::Idle | CallState::Ended => None,
        }
    }

    /// Kein Anruf aktiv; neue Anrufe sind möglich
    pub fn is_resting(&self) -> bool {
        matches!(self, CallState::Idle | CallState::Ended)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Initiating { .. } => "initiating",
            CallState::Ringing { .. } => "ringing",
            CallState::Incoming { .. } => "incoming",
            CallState::Negotiating { .. } => "negotiating",
            CallState::Connected { .. } => "connected",
            CallState::Ended => "ended",
        }
    }
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    RemoteRejected,
    ConnectionLost,
    Error(CallError),
}

/// Warum ein eingehendes Angebot verworfen wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissReason {
    Rejected,
    TimedOut,
    CallerCancelled,
}

/// Eingehendes Angebot, gehalten bis zur Entscheidung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallOffer {
    pub caller_id: UserId,
    pub caller_name: String,
    pub caller_pic: Option<String>,
    pub offer: SessionDescription,
}

/// Eigene Anzeige-Daten, die mit dem Offer verschickt werden
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalProfile {
    pub name: String,
    pub picture: Option<String>,
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall(IncomingCallOffer),
    IncomingCallDismissed {
        caller_id: UserId,
        reason: DismissReason,
    },
    RemoteStream(RemoteStream),
    DurationTick {
        seconds: u64,
    },
    MuteChanged(bool),
    Ended {
        peer: Option<UserId>,
        reason: EndReason,
    },
    Error(CallError),
}

/// Lesbare Momentaufnahme für die Oberfläche
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub duration_secs: u64,
    pub muted: bool,
    pub has_local_stream: bool,
    pub remote_stream: Option<RemoteStream>,
}

/// Formatiert eine Gesprächsdauer als `MM:SS`
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

#[derive(Default)]
struct Timers {
    decision: Option<CancellationToken>,
    ring: Option<CancellationToken>,
    duration: Option<CancellationToken>,
}

impl Timers {
    fn cancel_all(&mut self) {
        for token in [
            self.decision.take(),
            self.ring.take(),
            self.duration.take(),
        ]
        .into_iter()
        .flatten()
        {
            token.cancel();
        }
    }
}

/// Zustand der aktuellen Session; nur unter dem Engine-Mutex verändert
struct Session {
    phase: CallState,
    /// Zählt Sessions; Callbacks und Timer älterer Epochen werden ignoriert
    epoch: u64,
    role: Option<Role>,
    incoming: Option<IncomingCallOffer>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    negotiator: Option<Arc<dyn Negotiator>>,
    /// Offer bzw. Answer wurde an den Peer gesendet
    announced: bool,
    /// Remote Description ist gesetzt, Candidates können direkt angewendet werden
    remote_applied: bool,
    pending_local: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
    duration_secs: u64,
    muted: bool,
    timers: Timers,
}

/// Ressourcen, die beim Teardown außerhalb des Locks freigegeben werden
struct Released {
    local_stream: Option<LocalStream>,
    negotiator: Option<Arc<dyn Negotiator>>,
}

/// Unter dem Lock entschiedener Abschluss; Events folgen danach
enum Closing {
    Ended {
        peer: Option<UserId>,
        reason: EndReason,
        released: Released,
    },
    Dismissed {
        caller_id: UserId,
        reason: DismissReason,
    },
}

impl Session {
    fn new() -> Self {
        Self {
            phase: CallState::Idle,
            epoch: 0,
            role: None,
            incoming: None,
            local_stream: None,
            remote_stream: None,
            negotiator: None,
            announced: false,
            remote_applied: false,
            pending_local: Vec::new(),
            pending_remote: Vec::new(),
            duration_secs: 0,
            muted: false,
            timers: Timers::default(),
        }
    }

    /// Beginnt eine neue Epoche und setzt alle Felder auf Idle-Defaults
    fn reset(&mut self, phase: CallState) -> Released {
        self.timers.cancel_all();
        let released = Released {
            local_stream: self.local_stream.take(),
            negotiator: self.negotiator.take(),
        };
        let epoch = self.epoch + 1;
        *self = Session::new();
        self.epoch = epoch;
        self.phase = phase;
        released
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && !self.phase.is_resting()
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

struct EngineInner {
    config: EngineConfig,
    profile: LocalProfile,
    media: Arc<dyn MediaSource>,
    negotiation: Arc<dyn NegotiatorFactory>,
    signals: Arc<dyn SignalSink>,
    session: Mutex<Session>,
    event_tx: broadcast::Sender<CallEvent>,
}

/// Call Session Machine eines Teilnehmers
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

impl CallEngine {
    pub fn new(
        config: EngineConfig,
        profile: LocalProfile,
        media: Arc<dyn MediaSource>,
        negotiation: Arc<dyn NegotiatorFactory>,
        signals: Arc<dyn SignalSink>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(EngineInner {
                config,
                profile,
                media,
                negotiation,
                signals,
                session: Mutex::new(Session::new()),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.inner.session.lock().phase.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let session = self.inner.session.lock();
        CallSnapshot {
            state: session.phase.clone(),
            duration_secs: session.duration_secs,
            muted: session.muted,
            has_local_stream: session.local_stream.is_some(),
            remote_stream: session.remote_stream.clone(),
        }
    }

    /// Gesprächsdauer als `MM:SS`
    pub fn formatted_duration(&self) -> String {
        format_duration(self.inner.session.lock().duration_secs)
    }

    /// Aktuelles eingehendes Angebot (falls vorhanden)
    pub fn incoming_call(&self) -> Option<IncomingCallOffer> {
        self.inner.session.lock().incoming.clone()
    }

    // ========================================================================
    // CALLER
    // ========================================================================

    /// Startet einen ausgehenden Anruf.
    ///
    /// Fordert das Mikrofon an, erstellt die Negotiation und das Offer und
    /// sendet `call_initiate` an den Peer. Schlägt die Mikrofon-Anforderung
    /// fehl, endet die Session ohne den Peer zu kontaktieren.
    pub async fn initiate(&self, peer: UserId) -> Result<(), CallError> {
        let epoch = {
            let mut session = self.inner.session.lock();
            if !session.phase.is_resting() {
                return Err(CallError::AlreadyInCall);
            }
            session.reset(CallState::Initiating { peer: peer.clone() });
            session.role = Some(Role::Caller);
            session.epoch
        };
        tracing::info!("Starting call to {}", peer);
        self.emit(CallEvent::StateChanged(CallState::Initiating {
            peer: peer.clone(),
        }));

        let negotiator = self.prepare_media(epoch).await?;

        let offer = self
            .checked(epoch, negotiator.create_offer())
            .await?
            .map_err(|e| self.fail(epoch, e.into()))?;

        {
            let mut session = self.inner.session.lock();
            if !session.is_current(epoch) {
                return Err(CallError::Cancelled);
            }
            session.phase = CallState::Ringing { peer: peer.clone() };
            session.announced = true;
            self.send(ClientMessage::CallInitiate {
                to: peer.clone(),
                offer,
                caller_name: self.inner.profile.name.clone(),
                caller_pic: self.inner.profile.picture.clone(),
            });
            self.flush_local_candidates(&mut session, &peer);

            if let Some(timeout) = self.inner.config.ring_timeout {
                session.timers.ring = Some(self.spawn_timer(timeout, move |engine| {
                    engine.on_ring_timeout(epoch)
                }));
            }
        }
        self.emit(CallEvent::StateChanged(CallState::Ringing { peer }));
        Ok(())
    }

    /// Verarbeitet das Answer des Angerufenen (nur im Zustand `Ringing`)
    pub async fn handle_answer(
        &self,
        from: &UserId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let (epoch, negotiator) = {
            let mut session = self.inner.session.lock();
            let expected = matches!(&session.phase, CallState::Ringing { peer } if peer == from);
            let negotiator = match (&session.negotiator, expected) {
                (Some(negotiator), true) => Arc::clone(negotiator),
                _ => {
                    tracing::debug!(
                        "Ignoring answer from {} in state {}",
                        from,
                        session.phase.label()
                    );
                    return Ok(());
                }
            };
            if let Some(token) = session.timers.ring.take() {
                token.cancel();
            }
            session.phase = CallState::Negotiating { peer: from.clone() };
            (session.epoch, negotiator)
        };
        tracing::info!("Answer received from {}", from);
        self.emit(CallEvent::StateChanged(CallState::Negotiating {
            peer: from.clone(),
        }));

        self.checked(epoch, negotiator.set_remote_description(answer))
            .await?
            .map_err(|e| self.fail(epoch, e.into()))?;

        self.apply_pending_remote(epoch, &negotiator).await;
        Ok(())
    }

    // ========================================================================
    // CALLEE
    // ========================================================================

    /// Registriert ein eingehendes Angebot und startet den Entscheidungs-Timer.
    ///
    /// Ist bereits ein Anruf aktiv, wird der neue Anrufer abgewiesen.
    pub fn handle_incoming_offer(&self, offer: IncomingCallOffer) {
        let caller_id = offer.caller_id.clone();
        let state = {
            let mut session = self.inner.session.lock();
            if !session.phase.is_resting() {
                if session.phase.peer() != Some(&caller_id) {
                    tracing::info!("Busy, rejecting call from {}", caller_id);
                    self.send(ClientMessage::CallReject { to: caller_id });
                } else {
                    tracing::debug!("Ignoring duplicate offer from {}", caller_id);
                }
                return;
            }

            let state = CallState::Incoming {
                peer: caller_id.clone(),
                caller_name: offer.caller_name.clone(),
            };
            session.reset(state.clone());
            session.role = Some(Role::Callee);
            session.incoming = Some(offer.clone());

            let epoch = session.epoch;
            session.timers.decision = Some(self.spawn_timer(
                self.inner.config.decision_timeout,
                move |engine| engine.on_decision_timeout(epoch),
            ));
            state
        };

        tracing::info!("Incoming call from {} ({})", offer.caller_name, caller_id);
        self.emit(CallEvent::StateChanged(state));
        self.emit(CallEvent::IncomingCall(offer));
    }

    /// Nimmt das eingehende Angebot an.
    ///
    /// Jeder Fehler auf diesem Weg benachrichtigt den Anrufer per
    /// `call_reject`, damit er nicht endlos klingelt.
    pub async fn accept(&self) -> Result<(), CallError> {
        let (epoch, offer) = {
            let mut session = self.inner.session.lock();
            let Some(offer) = session.incoming.take() else {
                return Err(CallError::NoIncomingCall);
            };
            if let Some(token) = session.timers.decision.take() {
                token.cancel();
            }
            session.phase = CallState::Negotiating {
                peer: offer.caller_id.clone(),
            };
            (session.epoch, offer)
        };
        let peer = offer.caller_id.clone();
        tracing::info!("Accepting call from {}", peer);
        self.emit(CallEvent::StateChanged(CallState::Negotiating {
            peer: peer.clone(),
        }));

        let negotiator = self.prepare_media(epoch).await?;

        self.checked(epoch, negotiator.set_remote_description(offer.offer))
            .await?
            .map_err(|e| self.fail(epoch, e.into()))?;
        self.apply_pending_remote(epoch, &negotiator).await;

        let answer = self
            .checked(epoch, negotiator.create_answer())
            .await?
            .map_err(|e| self.fail(epoch, e.into()))?;

        let mut session = self.inner.session.lock();
        if !session.is_current(epoch) {
            return Err(CallError::Cancelled);
        }
        session.announced = true;
        self.send(ClientMessage::CallAccept {
            to: peer.clone(),
            answer,
        });
        self.flush_local_candidates(&mut session, &peer);
        Ok(())
    }

    /// Lehnt das eingehende Angebot ab
    pub fn reject(&self) -> Result<(), CallError> {
        self.dismiss_incoming(None, DismissReason::Rejected)
            .then_some(())
            .ok_or(CallError::NoIncomingCall)
    }

    // ========================================================================
    // BOTH SIDES
    // ========================================================================

    /// Beendet den Anruf. Idempotent: weitere Aufrufe sind No-ops.
    pub fn end(&self) {
        let closing = {
            let mut session = self.inner.session.lock();
            if session.incoming.is_some() {
                self.close_incoming(&mut session, DismissReason::Rejected)
            } else {
                self.close_active(&mut session, EndReason::LocalHangup)
            }
        };
        self.finish(closing);
    }

    /// Gegenseite hat aufgelegt
    pub fn handle_remote_end(&self, from: &UserId) {
        let closing = {
            let mut session = self.inner.session.lock();
            let incoming =
                matches!(&session.phase, CallState::Incoming { peer, .. } if peer == from);
            if incoming {
                self.close_incoming(&mut session, DismissReason::CallerCancelled)
            } else if session.phase.peer() == Some(from) {
                tracing::info!("Call ended by {}", from);
                self.close_active(&mut session, EndReason::RemoteHangup)
            } else {
                tracing::debug!(
                    "Ignoring call_end from {} in state {}",
                    from,
                    session.phase.label()
                );
                None
            }
        };
        self.finish(closing);
    }

    /// Gegenseite hat abgelehnt
    pub fn handle_remote_reject(&self, from: &UserId) {
        let closing = {
            let mut session = self.inner.session.lock();
            let expected = matches!(
                &session.phase,
                CallState::Initiating { peer }
                | CallState::Ringing { peer }
                | CallState::Negotiating { peer } if peer == from
            );
            if expected {
                tracing::info!("Call rejected by {}", from);
                self.close_active(&mut session, EndReason::RemoteRejected)
            } else {
                tracing::debug!(
                    "Ignoring call_reject from {} in state {}",
                    from,
                    session.phase.label()
                );
                None
            }
        };
        self.finish(closing);
    }

    /// Wendet einen ICE Candidate der Gegenseite an.
    ///
    /// Vor gesetzter Remote Description werden Candidates gepuffert;
    /// Fehler der Negotiation werden nur geloggt.
    pub async fn handle_remote_candidate(&self, from: &UserId, candidate: IceCandidate) {
        let negotiator = {
            let mut session = self.inner.session.lock();
            if session.phase.peer() != Some(from) {
                tracing::debug!("Ignoring ICE candidate from {}", from);
                return;
            }
            let ready = session.remote_applied;
            match session.negotiator.clone().filter(|_| ready) {
                Some(negotiator) => negotiator,
                None => {
                    session.pending_remote.push(candidate);
                    return;
                }
            }
        };

        tracing::debug!("ICE candidate from {}", from);
        if let Err(e) = negotiator.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate: {}", e);
        }
    }

    /// Schaltet das lokale Mikrofon stumm bzw. wieder an, ohne Renegotiation.
    ///
    /// Gibt den neuen Mute-Status zurück; ohne lokalen Stream ein No-op.
    pub fn toggle_mute(&self) -> bool {
        let muted = {
            let mut session = self.inner.session.lock();
            let active = matches!(
                session.phase,
                CallState::Negotiating { .. } | CallState::Connected { .. }
            );
            let Some(stream) = session.local_stream.clone().filter(|_| active) else {
                return session.muted;
            };
            session.muted = !session.muted;
            stream.set_enabled(!session.muted);
            session.muted
        };

        tracing::debug!("Audio muted: {}", muted);
        self.emit(CallEvent::MuteChanged(muted));
        muted
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Mikrofon anfordern, Negotiation erzeugen und lokalen Stream anmelden
    async fn prepare_media(&self, epoch: u64) -> Result<Arc<dyn Negotiator>, CallError> {
        let stream = match self.inner.media.acquire_audio().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(epoch, e.into())),
        };
        let attached = {
            let mut session = self.inner.session.lock();
            let current = session.is_current(epoch);
            if current {
                session.local_stream = Some(stream.clone());
            }
            current
        };
        if !attached {
            // Anruf wurde während der Freigabe beendet
            stream.stop();
            return Err(CallError::Cancelled);
        }

        let negotiator = self
            .inner
            .negotiation
            .create(self.negotiation_handler(epoch))
            .await
            .map_err(|e| self.fail(epoch, e.into()))?;
        let attached = {
            let mut session = self.inner.session.lock();
            let current = session.is_current(epoch);
            if current {
                session.negotiator = Some(Arc::clone(&negotiator));
            }
            current
        };
        if !attached {
            negotiator.close().await;
            return Err(CallError::Cancelled);
        }

        self.checked(epoch, negotiator.add_local_stream(&stream))
            .await?
            .map_err(|e| self.fail(epoch, e.into()))?;

        Ok(negotiator)
    }

    /// Wartet auf `fut` und prüft danach, ob die Session noch aktuell ist
    async fn checked<T>(&self, epoch: u64, fut: impl Future<Output = T>) -> Result<T, CallError> {
        let output = fut.await;
        if self.inner.session.lock().is_current(epoch) {
            Ok(output)
        } else {
            Err(CallError::Cancelled)
        }
    }

    /// Wendet gepufferte Candidates in Empfangsreihenfolge an.
    ///
    /// Erst wenn der Puffer leer ist, gilt die Remote Description als gesetzt;
    /// bis dahin landen neue Candidates hinten im Puffer.
    async fn apply_pending_remote(&self, epoch: u64, negotiator: &Arc<dyn Negotiator>) {
        loop {
            let pending = {
                let mut session = self.inner.session.lock();
                if !session.is_current(epoch) {
                    return;
                }
                if session.pending_remote.is_empty() {
                    session.remote_applied = true;
                    return;
                }
                std::mem::take(&mut session.pending_remote)
            };

            for candidate in pending {
                if let Err(e) = negotiator.add_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add buffered ICE candidate: {}", e);
                }
            }
        }
    }

    fn flush_local_candidates(&self, session: &mut Session, peer: &UserId) {
        for candidate in std::mem::take(&mut session.pending_local) {
            self.send(ClientMessage::IceCandidate {
                to: peer.clone(),
                candidate,
            });
        }
    }

    /// Fehler der aktuellen Session: melden und Session beenden
    fn fail(&self, epoch: u64, error: CallError) -> CallError {
        tracing::error!("Call failed: {}", error);
        if self.teardown(epoch, EndReason::Error(error.clone())) {
            self.emit(CallEvent::Error(error.clone()));
        }
        error
    }

    /// Beendet die Session der Epoche `epoch`, falls sie noch aktiv ist
    fn teardown(&self, epoch: u64, reason: EndReason) -> bool {
        let closing = {
            let mut session = self.inner.session.lock();
            if session.epoch != epoch {
                return false;
            }
            self.close_active(&mut session, reason)
        };
        self.finish(closing)
    }

    /// Verwirft das eingehende Angebot und kehrt nach `Idle` zurück
    fn dismiss_incoming(&self, epoch: Option<u64>, reason: DismissReason) -> bool {
        let closing = {
            let mut session = self.inner.session.lock();
            if epoch.is_some_and(|e| e != session.epoch) {
                return false;
            }
            self.close_incoming(&mut session, reason)
        };
        self.finish(closing)
    }

    /// Einziger Teardown-Pfad aller aktiven Sessions; läuft unter dem Lock.
    ///
    /// Benachrichtigt den Peer, sofern der Abbau nicht von ihm ausging.
    fn close_active(&self, session: &mut Session, reason: EndReason) -> Option<Closing> {
        if session.phase.is_resting() {
            return None;
        }

        let peer = session.phase.peer().cloned();
        let remote_initiated = matches!(
            reason,
            EndReason::RemoteHangup | EndReason::RemoteRejected
        );
        if let (Some(to), false) = (peer.clone(), remote_initiated) {
            if session.announced {
                self.send(ClientMessage::CallEnd { to });
            } else if session.role == Some(Role::Callee) {
                // Answer nie gesendet: Anrufer klingelt noch
                self.send(ClientMessage::CallReject { to });
            }
        }

        Some(Closing::Ended {
            peer,
            reason,
            released: session.reset(CallState::Ended),
        })
    }

    fn close_incoming(&self, session: &mut Session, reason: DismissReason) -> Option<Closing> {
        let offer = session.incoming.take()?;
        if reason != DismissReason::CallerCancelled {
            self.send(ClientMessage::CallReject {
                to: offer.caller_id.clone(),
            });
        }
        session.reset(CallState::Idle);
        Some(Closing::Dismissed {
            caller_id: offer.caller_id,
            reason,
        })
    }

    /// Gibt Ressourcen frei und meldet den Abschluss; `false` ohne Abschluss
    fn finish(&self, closing: Option<Closing>) -> bool {
        match closing {
            None => false,
            Some(Closing::Ended {
                peer,
                reason,
                released,
            }) => {
                self.release(released);
                tracing::info!("Call with {:?} ended: {:?}", peer, reason);
                self.emit(CallEvent::StateChanged(CallState::Ended));
                self.emit(CallEvent::Ended { peer, reason });
                true
            }
            Some(Closing::Dismissed { caller_id, reason }) => {
                tracing::info!("Incoming call from {} dismissed: {:?}", caller_id, reason);
                self.emit(CallEvent::StateChanged(CallState::Idle));
                self.emit(CallEvent::IncomingCallDismissed { caller_id, reason });
                true
            }
        }
    }

    fn release(&self, released: Released) {
        if let Some(stream) = released.local_stream {
            stream.stop();
        }
        if let Some(negotiator) = released.negotiator {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { negotiator.close().await });
                }
                Err(_) => tracing::warn!("No runtime available to close negotiator"),
            }
        }
    }

    fn on_decision_timeout(&self, epoch: u64) {
        tracing::info!("Incoming call not answered in time");
        self.dismiss_incoming(Some(epoch), DismissReason::TimedOut);
    }

    fn on_ring_timeout(&self, epoch: u64) {
        let error = CallError::PeerUnreachable;
        let closing = {
            let mut session = self.inner.session.lock();
            let ringing =
                session.epoch == epoch && matches!(session.phase, CallState::Ringing { .. });
            if !ringing {
                return;
            }
            self.close_active(&mut session, EndReason::Error(error.clone()))
        };
        if self.finish(closing) {
            tracing::error!("Call failed: {}", error);
            self.emit(CallEvent::Error(error));
        }
    }

    fn on_tick(&self, epoch: u64) {
        let seconds = {
            let mut session = self.inner.session.lock();
            if session.epoch != epoch || !matches!(session.phase, CallState::Connected { .. }) {
                return;
            }
            session.duration_secs += 1;
            session.duration_secs
        };
        self.emit(CallEvent::DurationTick { seconds });
    }

    fn negotiation_handler(&self, epoch: u64) -> NegotiationEventHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                CallEngine { inner }.on_negotiation_event(epoch, event);
            }
        })
    }

    fn on_negotiation_event(&self, epoch: u64, event: NegotiationEvent) {
        match event {
            NegotiationEvent::LocalCandidate(candidate) => {
                let mut session = self.inner.session.lock();
                if !session.is_current(epoch) {
                    return;
                }
                let Some(peer) = session.phase.peer().cloned() else {
                    return;
                };
                if session.announced {
                    tracing::debug!("Sending ICE candidate to {}", peer);
                    self.send(ClientMessage::IceCandidate {
                        to: peer,
                        candidate,
                    });
                } else {
                    session.pending_local.push(candidate);
                }
            }

            NegotiationEvent::ConnectivityChanged(ConnectivityState::Connected) => {
                let peer = {
                    let mut session = self.inner.session.lock();
                    let CallState::Negotiating { peer } = &session.phase else {
                        return;
                    };
                    if session.epoch != epoch {
                        return;
                    }
                    let peer = peer.clone();
                    session.phase = CallState::Connected { peer: peer.clone() };
                    session.duration_secs = 0;
                    let tick = self.inner.config.duration_tick;
                    session.timers.duration = Some(self.spawn_ticker(tick, epoch));
                    peer
                };
                tracing::info!("Call with {} connected", peer);
                self.emit(CallEvent::StateChanged(CallState::Connected { peer }));
            }

            NegotiationEvent::ConnectivityChanged(
                ConnectivityState::Disconnected | ConnectivityState::Failed,
            ) => {
                let closing = {
                    let mut session = self.inner.session.lock();
                    let degraded = session.epoch == epoch
                        && matches!(
                            session.phase,
                            CallState::Negotiating { .. } | CallState::Connected { .. }
                        );
                    if !degraded {
                        return;
                    }
                    self.close_active(&mut session, EndReason::ConnectionLost)
                };
                self.finish(closing);
            }

            NegotiationEvent::ConnectivityChanged(_) => {}

            NegotiationEvent::RemoteTrack(stream) => {
                {
                    let mut session = self.inner.session.lock();
                    if !session.is_current(epoch) {
                        return;
                    }
                    session.remote_stream = Some(stream.clone());
                }
                self.emit(CallEvent::RemoteStream(stream));
            }
        }
    }

    /// Startet einen einmaligen, abbrechbaren Timer
    fn spawn_timer(
        &self,
        delay: Duration,
        on_fire: impl FnOnce(CallEngine) + Send + 'static,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        on_fire(CallEngine { inner });
                    }
                }
            }
        });
        token
    }

    /// Startet den Gesprächsdauer-Zähler (erster Tick nach `tick`)
    fn spawn_ticker(&self, tick: Duration, epoch: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + tick;
            let mut interval = tokio::time::interval_at(start, tick);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        CallEngine { inner }.on_tick(epoch);
                    }
                }
            }
        });
        token
    }

    /// Best-effort Versand über den Hub
    fn send(&self, message: ClientMessage) {
        if let Err(e) = self.inner.signals.send(message) {
            tracing::warn!("Failed to send signaling message: {}", e);
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("CallEngine")
            .field("state", &session.phase)
            .field("epoch", &session.epoch)
            .field("is_muted", &session.muted)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::fakes::{
        FakeMediaSource, FakeNegotiator, FakeNegotiatorFactory, LoopbackSink, RecordingSignalSink,
        MALFORMED_SDP,
    };
    use crate::call_engine::media::AudioTrack;
    use crate::hub::{PresenceHub, RouteOutcome};
    use crate::signaling::ServerMessage;
    use tokio::sync::mpsc;

    struct Harness {
        engine: CallEngine,
        media: Arc<FakeMediaSource>,
        negotiation: Arc<FakeNegotiatorFactory>,
        signals: Arc<RecordingSignalSink>,
        events: broadcast::Receiver<CallEvent>,
    }

    impl Harness {
        fn negotiator(&self) -> Arc<FakeNegotiator> {
            self.negotiation.last().expect("no negotiator created")
        }

        fn drain_events(&mut self) -> Vec<CallEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn harness_with(config: EngineConfig, media: FakeMediaSource) -> Harness {
        let media = Arc::new(media);
        let negotiation = Arc::new(FakeNegotiatorFactory::new());
        let signals = Arc::new(RecordingSignalSink::new());
        let engine = CallEngine::new(
            config,
            LocalProfile {
                name: "Alice".into(),
                picture: None,
            },
            media.clone(),
            negotiation.clone(),
            signals.clone(),
        );
        let events = engine.subscribe();
        Harness {
            engine,
            media,
            negotiation,
            signals,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), FakeMediaSource::granting())
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn offer_from(caller: &str) -> IncomingCallOffer {
        IncomingCallOffer {
            caller_id: UserId::new(caller),
            caller_name: caller.to_uppercase(),
            caller_pic: None,
            offer: SessionDescription::offer("v=0 remote-offer"),
        }
    }

    async fn connected_as_caller(h: &Harness) {
        h.engine.initiate(bob()).await.unwrap();
        h.engine
            .handle_answer(&bob(), SessionDescription::answer("v=0 remote-answer"))
            .await
            .unwrap();
        h.negotiator().set_connectivity(ConnectivityState::Connected);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(125), "02:05");
        assert_eq!(format_duration(3600), "60:00");
    }

    #[tokio::test]
    async fn test_initiate_sends_offer_before_candidates() {
        let h = harness();
        h.engine.initiate(bob()).await.unwrap();

        assert_eq!(h.engine.state(), CallState::Ringing { peer: bob() });
        let sent = h.signals.sent();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            ClientMessage::CallInitiate {
                to,
                offer,
                caller_name,
                ..
            } => {
                assert_eq!(to, &bob());
                assert_eq!(offer.kind, crate::signaling::SdpKind::Offer);
                assert_eq!(caller_name, "Alice");
            }
            other => panic!("expected call_initiate, got {:?}", other),
        }
        assert!(matches!(&sent[1], ClientMessage::IceCandidate { to, .. } if to == &bob()));

        // Nach dem Offer gehen neue Candidates direkt raus
        h.negotiator().emit_candidate();
        assert_eq!(h.signals.sent().len(), 3);
        assert_eq!(h.negotiator().local_streams(), vec!["mic-0".to_string()]);
    }

    #[tokio::test]
    async fn test_initiate_rejected_while_in_call() {
        let h = harness();
        h.engine.initiate(bob()).await.unwrap();

        let result = h.engine.initiate(UserId::new("carol")).await;
        assert_eq!(result, Err(CallError::AlreadyInCall));
        assert_eq!(h.engine.state(), CallState::Ringing { peer: bob() });
    }

    #[tokio::test]
    async fn test_media_denied_ends_without_contacting_peer() {
        let mut h = harness_with(EngineConfig::default(), FakeMediaSource::denying());

        let result = h.engine.initiate(bob()).await;
        assert_eq!(result, Err(CallError::MediaDenied));
        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.signals.sent().is_empty());
        assert!(h.negotiation.created().is_empty());

        let events = h.drain_events();
        assert!(events.contains(&CallEvent::Error(CallError::MediaDenied)));
        assert!(events.contains(&CallEvent::Ended {
            peer: Some(bob()),
            reason: EndReason::Error(CallError::MediaDenied),
        }));
    }

    #[tokio::test]
    async fn test_missing_microphone_ends_without_contacting_peer() {
        let mut h = harness_with(
            EngineConfig::default(),
            FakeMediaSource::unavailable("no input device"),
        );

        let result = h.engine.initiate(bob()).await;
        let expected = CallError::MediaUnavailable("no input device".into());
        assert_eq!(result, Err(expected.clone()));
        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.signals.sent().is_empty());
        assert!(h.negotiation.created().is_empty());
        assert!(h.drain_events().contains(&CallEvent::Error(expected)));
    }

    #[tokio::test]
    async fn test_missing_microphone_on_accept_rejects_caller() {
        let h = harness_with(
            EngineConfig::default(),
            FakeMediaSource::unavailable("device busy"),
        );
        h.engine.handle_incoming_offer(offer_from("carol"));

        let result = h.engine.accept().await;

        assert_eq!(
            result,
            Err(CallError::MediaUnavailable("device busy".into()))
        );
        assert_eq!(h.engine.state(), CallState::Ended);
        assert_eq!(
            h.signals.sent(),
            vec![ClientMessage::CallReject {
                to: UserId::new("carol")
            }]
        );
    }

    #[tokio::test]
    async fn test_negotiator_failure_releases_microphone() {
        let h = harness();
        h.negotiation.fail_next();

        let result = h.engine.initiate(bob()).await;
        assert!(matches!(result, Err(CallError::NegotiationFailed(_))));
        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.media.issued()[0].tracks()[0].is_stopped());
        assert!(h.signals.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_call_counts_duration() {
        let mut h = harness();
        connected_as_caller(&h).await;
        assert_eq!(h.engine.state(), CallState::Connected { peer: bob() });

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(h.engine.snapshot().duration_secs, 3);
        assert_eq!(h.engine.formatted_duration(), "00:03");

        let ticks: Vec<u64> = h
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::DurationTick { seconds } => Some(seconds),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_answer_from_wrong_peer_is_ignored() {
        let h = harness();
        h.engine.initiate(bob()).await.unwrap();

        h.engine
            .handle_answer(&UserId::new("mallory"), SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.engine.state(), CallState::Ringing { peer: bob() });
        assert!(h.negotiator().remote_description().is_none());
    }

    #[tokio::test]
    async fn test_answer_outside_ringing_is_ignored() {
        let mut h = harness();

        h.engine
            .handle_answer(&bob(), SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.engine.state(), CallState::Idle);
        assert!(h.negotiation.created().is_empty());
        assert!(h.drain_events().is_empty());

        h.engine.initiate(bob()).await.unwrap();
        h.engine.end();
        h.drain_events();
        h.signals.take();

        h.engine
            .handle_answer(&bob(), SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.negotiator().remote_description().is_none());
        assert!(h.drain_events().is_empty());
        assert!(h.signals.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_is_idempotent_and_releases_resources() {
        let mut h = harness();
        connected_as_caller(&h).await;
        h.signals.take();
        h.drain_events();

        h.engine.end();
        h.engine.end();
        tokio::task::yield_now().await;

        let ends: Vec<_> = h
            .signals
            .sent()
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::CallEnd { .. }))
            .collect();
        assert_eq!(ends, vec![ClientMessage::CallEnd { to: bob() }]);

        let ended = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, CallEvent::Ended { .. }))
            .count();
        assert_eq!(ended, 1);

        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.media.issued()[0].tracks()[0].is_stopped());
        assert!(h.negotiator().is_closed());

        // Nach dem Ende läuft kein Timer mehr
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.engine.snapshot().duration_secs, 0);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_remote_hangup_does_not_echo_call_end() {
        let mut h = harness();
        connected_as_caller(&h).await;
        h.signals.take();

        h.engine.handle_remote_end(&bob());

        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.signals.sent().is_empty());
        assert!(h.drain_events().contains(&CallEvent::Ended {
            peer: Some(bob()),
            reason: EndReason::RemoteHangup,
        }));
    }

    #[tokio::test]
    async fn test_late_signals_from_previous_peer_spare_new_session() {
        let h = harness();
        connected_as_caller(&h).await;
        h.engine.end();
        h.engine.initiate(UserId::new("carol")).await.unwrap();
        h.signals.take();

        h.engine.handle_remote_end(&bob());
        h.engine.handle_remote_reject(&bob());

        assert_eq!(
            h.engine.state(),
            CallState::Ringing {
                peer: UserId::new("carol")
            }
        );
        assert!(h.signals.sent().is_empty());
        assert!(!h.negotiator().is_closed());
    }

    #[tokio::test]
    async fn test_remote_reject_while_ringing() {
        let mut h = harness();
        h.engine.initiate(bob()).await.unwrap();
        h.signals.take();

        h.engine.handle_remote_reject(&bob());

        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.signals.sent().is_empty());
        assert!(h.drain_events().contains(&CallEvent::Ended {
            peer: Some(bob()),
            reason: EndReason::RemoteRejected,
        }));
    }

    #[tokio::test]
    async fn test_connection_failure_ends_call() {
        let mut h = harness();
        connected_as_caller(&h).await;
        h.signals.take();

        h.negotiator().set_connectivity(ConnectivityState::Failed);

        assert_eq!(h.engine.state(), CallState::Ended);
        assert_eq!(h.signals.sent(), vec![ClientMessage::CallEnd { to: bob() }]);
        assert!(h.drain_events().contains(&CallEvent::Ended {
            peer: Some(bob()),
            reason: EndReason::ConnectionLost,
        }));
    }

    #[tokio::test]
    async fn test_toggle_mute_flips_track() {
        let mut h = harness();
        assert!(!h.engine.toggle_mute(), "no stream while idle");

        connected_as_caller(&h).await;
        h.drain_events();
        let track = h.media.issued()[0].tracks()[0].clone();

        assert!(h.engine.toggle_mute());
        assert!(!track.is_enabled());
        assert!(!h.engine.toggle_mute());
        assert!(track.is_enabled());

        let mutes: Vec<_> = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, CallEvent::MuteChanged(_)))
            .collect();
        assert_eq!(
            mutes,
            vec![CallEvent::MuteChanged(true), CallEvent::MuteChanged(false)]
        );
        // Mute erzeugt keine Renegotiation
        assert_eq!(h.negotiation.created().len(), 1);
    }

    #[tokio::test]
    async fn test_toggle_mute_covers_every_track() {
        let h = harness_with(
            EngineConfig::default(),
            FakeMediaSource::granting().with_tracks(2),
        );
        connected_as_caller(&h).await;
        let stream = h.media.issued()[0].clone();
        assert_eq!(stream.tracks().len(), 2);

        assert!(h.engine.toggle_mute());
        assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
        assert!(!h.engine.toggle_mute());
        assert!(stream.tracks().iter().all(|t| t.is_enabled()));
        assert!(!h.engine.snapshot().muted);
    }

    #[tokio::test]
    async fn test_remote_track_is_exposed() {
        let mut h = harness();
        connected_as_caller(&h).await;
        let stream = RemoteStream {
            id: "remote".into(),
            track_ids: vec!["audio".into()],
        };

        h.negotiator().emit_remote_track(stream.clone());

        assert_eq!(h.engine.snapshot().remote_stream, Some(stream.clone()));
        assert!(h.drain_events().contains(&CallEvent::RemoteStream(stream)));
    }

    #[tokio::test]
    async fn test_incoming_offer_then_accept() {
        let mut h = harness();
        h.engine.handle_incoming_offer(offer_from("carol"));

        assert_eq!(
            h.engine.state(),
            CallState::Incoming {
                peer: UserId::new("carol"),
                caller_name: "CAROL".into(),
            }
        );
        assert!(h
            .drain_events()
            .contains(&CallEvent::IncomingCall(offer_from("carol"))));
        assert!(h.negotiation.created().is_empty());

        h.engine.accept().await.unwrap();

        assert_eq!(
            h.engine.state(),
            CallState::Negotiating {
                peer: UserId::new("carol")
            }
        );
        assert_eq!(
            h.negotiator().remote_description(),
            Some(SessionDescription::offer("v=0 remote-offer"))
        );
        let sent = h.signals.sent();
        assert!(matches!(&sent[0], ClientMessage::CallAccept { to, .. } if to.as_str() == "carol"));
        assert!(matches!(&sent[1], ClientMessage::IceCandidate { .. }));
        assert_eq!(h.engine.incoming_call(), None);
    }

    #[tokio::test]
    async fn test_accept_without_offer_fails() {
        let h = harness();
        assert_eq!(h.engine.accept().await, Err(CallError::NoIncomingCall));
        assert_eq!(h.engine.reject(), Err(CallError::NoIncomingCall));
    }

    #[tokio::test]
    async fn test_remote_candidates_are_buffered_until_offer_applied() {
        let h = harness();
        let carol = UserId::new("carol");
        h.engine.handle_incoming_offer(offer_from("carol"));

        let early = IceCandidate::new("candidate:early");
        h.engine
            .handle_remote_candidate(&carol, early.clone())
            .await;
        h.engine
            .handle_remote_candidate(&UserId::new("mallory"), IceCandidate::new("candidate:x"))
            .await;

        h.engine.accept().await.unwrap();
        assert_eq!(h.negotiator().applied_candidates(), vec![early.clone()]);

        let late = IceCandidate::new("candidate:late");
        h.engine.handle_remote_candidate(&carol, late.clone()).await;
        assert_eq!(h.negotiator().applied_candidates(), vec![early, late]);
    }

    #[tokio::test]
    async fn test_candidates_arriving_during_flush_keep_order() {
        let h = harness();
        let carol = UserId::new("carol");
        h.negotiation.hold_candidates();
        h.engine.handle_incoming_offer(offer_from("carol"));

        let first = IceCandidate::new("candidate:1");
        let second = IceCandidate::new("candidate:2");
        let third = IceCandidate::new("candidate:3");
        h.engine.handle_remote_candidate(&carol, first.clone()).await;
        h.engine.handle_remote_candidate(&carol, second.clone()).await;

        let engine = h.engine.clone();
        let accept = tokio::spawn(async move { engine.accept().await });

        // accept hängt am ersten gepufferten Candidate
        tokio::time::timeout(Duration::from_secs(5), async {
            while !h
                .negotiation
                .last()
                .is_some_and(|n| n.remote_description().is_some())
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let engine = h.engine.clone();
        let late = third.clone();
        let arriving = tokio::spawn(async move {
            engine
                .handle_remote_candidate(&UserId::new("carol"), late)
                .await
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        h.negotiator().release_candidates();
        accept.await.unwrap().unwrap();
        arriving.await.unwrap();

        assert_eq!(
            h.negotiator().applied_candidates(),
            vec![first, second, third]
        );
    }

    #[tokio::test]
    async fn test_reject_notifies_caller() {
        let mut h = harness();
        h.engine.handle_incoming_offer(offer_from("carol"));

        h.engine.reject().unwrap();

        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(
            h.signals.sent(),
            vec![ClientMessage::CallReject {
                to: UserId::new("carol")
            }]
        );
        assert!(h.drain_events().contains(&CallEvent::IncomingCallDismissed {
            caller_id: UserId::new("carol"),
            reason: DismissReason::Rejected,
        }));
        assert!(h.media.issued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_offer_times_out() {
        let mut h = harness();
        h.engine.handle_incoming_offer(offer_from("carol"));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(matches!(h.engine.state(), CallState::Incoming { .. }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(
            h.signals.sent(),
            vec![ClientMessage::CallReject {
                to: UserId::new("carol")
            }]
        );
        assert!(h.drain_events().contains(&CallEvent::IncomingCallDismissed {
            caller_id: UserId::new("carol"),
            reason: DismissReason::TimedOut,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_offer_cancels_decision_timer() {
        let h = harness();
        h.engine.handle_incoming_offer(offer_from("carol"));
        h.engine.accept().await.unwrap();

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(matches!(h.engine.state(), CallState::Negotiating { .. }));
        assert!(!h
            .signals
            .sent()
            .iter()
            .any(|m| matches!(m, ClientMessage::CallReject { .. })));
    }

    #[tokio::test]
    async fn test_caller_cancel_dismisses_incoming_offer() {
        let mut h = harness();
        h.engine.handle_incoming_offer(offer_from("carol"));

        h.engine.handle_remote_end(&UserId::new("carol"));

        assert_eq!(h.engine.state(), CallState::Idle);
        assert!(h.signals.sent().is_empty());
        assert!(h.drain_events().contains(&CallEvent::IncomingCallDismissed {
            caller_id: UserId::new("carol"),
            reason: DismissReason::CallerCancelled,
        }));
    }

    #[tokio::test]
    async fn test_busy_engine_rejects_second_caller() {
        let h = harness();
        h.engine.initiate(bob()).await.unwrap();
        h.signals.take();

        h.engine.handle_incoming_offer(offer_from("carol"));

        assert_eq!(h.engine.state(), CallState::Ringing { peer: bob() });
        assert_eq!(
            h.signals.sent(),
            vec![ClientMessage::CallReject {
                to: UserId::new("carol")
            }]
        );
    }

    #[tokio::test]
    async fn test_accept_failure_rejects_caller() {
        let mut h = harness();
        let mut offer = offer_from("carol");
        offer.offer = SessionDescription::offer(MALFORMED_SDP);
        h.engine.handle_incoming_offer(offer);

        let result = h.engine.accept().await;

        assert!(matches!(result, Err(CallError::NegotiationFailed(_))));
        assert_eq!(h.engine.state(), CallState::Ended);
        assert_eq!(
            h.signals.sent(),
            vec![ClientMessage::CallReject {
                to: UserId::new("carol")
            }]
        );
        assert!(h.media.issued()[0].tracks()[0].is_stopped());
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, CallEvent::Error(CallError::NegotiationFailed(_)))));
    }

    #[tokio::test]
    async fn test_end_during_media_acquisition_discards_result() {
        let media = FakeMediaSource::granting();
        media.hold();
        let h = harness_with(EngineConfig::default(), media);

        let engine = h.engine.clone();
        let pending = tokio::spawn(async move { engine.initiate(bob()).await });
        tokio::task::yield_now().await;
        assert_eq!(h.engine.state(), CallState::Initiating { peer: bob() });

        h.engine.end();
        h.media.release();

        assert_eq!(pending.await.unwrap(), Err(CallError::Cancelled));
        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.media.issued()[0].tracks()[0].is_stopped());
        assert!(h.negotiation.created().is_empty());
        assert!(h.signals.sent().is_empty());
    }

    #[tokio::test]
    async fn test_end_during_accept_rejects_caller() {
        let media = FakeMediaSource::granting();
        media.hold();
        let h = harness_with(EngineConfig::default(), media);
        h.engine.handle_incoming_offer(offer_from("carol"));

        let engine = h.engine.clone();
        let pending = tokio::spawn(async move { engine.accept().await });
        tokio::task::yield_now().await;
        assert_eq!(
            h.engine.state(),
            CallState::Negotiating {
                peer: UserId::new("carol")
            }
        );
        assert_eq!(h.engine.incoming_call(), None);

        h.engine.end();
        assert_eq!(h.engine.state(), CallState::Ended);
        h.media.release();

        assert_eq!(pending.await.unwrap(), Err(CallError::Cancelled));
        assert_eq!(
            h.signals.sent(),
            vec![ClientMessage::CallReject {
                to: UserId::new("carol")
            }]
        );
        assert!(h.media.issued()[0].tracks()[0].is_stopped());
        assert!(h.negotiation.created().is_empty());
    }

    #[tokio::test]
    async fn test_stale_negotiation_events_are_ignored() {
        let h = harness();
        connected_as_caller(&h).await;
        let old = h.negotiator();
        h.engine.end();

        h.engine.initiate(UserId::new("carol")).await.unwrap();
        h.signals.take();

        old.set_connectivity(ConnectivityState::Connected);
        old.emit_candidate();
        old.set_connectivity(ConnectivityState::Failed);

        assert_eq!(
            h.engine.state(),
            CallState::Ringing {
                peer: UserId::new("carol")
            }
        );
        assert!(h.signals.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_reports_unreachable_peer() {
        let config = EngineConfig {
            ring_timeout: Some(Duration::from_secs(45)),
            ..EngineConfig::default()
        };
        let mut h = harness_with(config, FakeMediaSource::granting());
        h.engine.initiate(bob()).await.unwrap();
        h.signals.take();

        tokio::time::sleep(Duration::from_secs(46)).await;

        assert_eq!(h.engine.state(), CallState::Ended);
        assert_eq!(h.signals.sent(), vec![ClientMessage::CallEnd { to: bob() }]);
        assert!(h
            .drain_events()
            .contains(&CallEvent::Error(CallError::PeerUnreachable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_ring_timeout_caller_keeps_ringing() {
        let h = harness();
        h.engine.initiate(bob()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.engine.state(), CallState::Ringing { peer: bob() });
    }

    // ------------------------------------------------------------------------
    // Zwei Engines über einen Presence Hub
    // ------------------------------------------------------------------------

    /// Übersetzt Hub-Nachrichten in Engine-Aufrufe
    fn pump(engine: CallEngine, mut rx: mpsc::Receiver<ServerMessage>) {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ServerMessage::CallIncoming {
                        caller_id,
                        caller_name,
                        caller_pic,
                        offer,
                    } => engine.handle_incoming_offer(IncomingCallOffer {
                        caller_id,
                        caller_name,
                        caller_pic,
                        offer,
                    }),
                    ServerMessage::CallAccepted { from, answer } => {
                        let _ = engine.handle_answer(&from, answer).await;
                    }
                    ServerMessage::CallRejected { from } => engine.handle_remote_reject(&from),
                    ServerMessage::CallEnded { from } => engine.handle_remote_end(&from),
                    ServerMessage::IceCandidate { from, candidate } => {
                        engine.handle_remote_candidate(&from, candidate).await
                    }
                    _ => {}
                }
            }
        });
    }

    struct Peer {
        engine: CallEngine,
        negotiation: Arc<FakeNegotiatorFactory>,
        events: broadcast::Receiver<CallEvent>,
    }

    fn peer_on_hub(hub: &Arc<PresenceHub>, name: &str) -> (Peer, crate::hub::PresenceGuard) {
        let id = UserId::new(name);
        let (handle, rx) = hub.connect(id.clone());
        let guard = hub.admit(handle);

        let negotiation = Arc::new(FakeNegotiatorFactory::new());
        let engine = CallEngine::new(
            EngineConfig::default(),
            LocalProfile {
                name: name.to_uppercase(),
                picture: None,
            },
            Arc::new(FakeMediaSource::granting()),
            negotiation.clone(),
            Arc::new(LoopbackSink::new(Arc::clone(hub), id)),
        );
        let events = engine.subscribe();
        pump(engine.clone(), rx);
        (
            Peer {
                engine,
                negotiation,
                events,
            },
            guard,
        )
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<CallEvent>,
        wanted: impl Fn(&CallEvent) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if wanted(&event) => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for event");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_call_between_two_engines() {
        let hub = Arc::new(PresenceHub::new(64));
        let (mut alice, _alice_guard) = peer_on_hub(&hub, "alice");
        let (mut bob, _bob_guard) = peer_on_hub(&hub, "bob");

        alice.engine.initiate(UserId::new("bob")).await.unwrap();
        wait_for(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall(_))).await;
        assert_eq!(
            bob.engine.state(),
            CallState::Incoming {
                peer: UserId::new("alice"),
                caller_name: "ALICE".into(),
            }
        );

        bob.engine.accept().await.unwrap();
        wait_for(&mut alice.events, |e| {
            matches!(e, CallEvent::StateChanged(CallState::Negotiating { .. }))
        })
        .await;

        let alice_neg = alice.negotiation.last().unwrap();
        let bob_neg = bob.negotiation.last().unwrap();
        assert_eq!(alice_neg.remote_description(), bob_neg.local_description());
        assert_eq!(bob_neg.remote_description(), alice_neg.local_description());

        alice_neg.set_connectivity(ConnectivityState::Connected);
        bob_neg.set_connectivity(ConnectivityState::Connected);
        assert!(matches!(alice.engine.state(), CallState::Connected { .. }));
        assert!(matches!(bob.engine.state(), CallState::Connected { .. }));

        // Trickle ICE ist angekommen: je ein Candidate pro Seite
        tokio::time::timeout(Duration::from_secs(5), async {
            while alice_neg.applied_candidates().is_empty()
                || bob_neg.applied_candidates().is_empty()
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(alice.engine.formatted_duration(), "00:05");
        assert_eq!(bob.engine.formatted_duration(), "00:05");

        alice.engine.end();
        wait_for(&mut bob.events, |e| {
            matches!(
                e,
                CallEvent::Ended {
                    reason: EndReason::RemoteHangup,
                    ..
                }
            )
        })
        .await;
        assert_eq!(bob.engine.state(), CallState::Ended);
        assert_eq!(alice.engine.state(), CallState::Ended);

        // Ein doppeltes call_end ändert nichts mehr
        while bob.events.try_recv().is_ok() {}
        let outcome = hub.route(
            &UserId::new("bob"),
            ServerMessage::CallEnded {
                from: UserId::new("alice"),
            },
        );
        assert_eq!(outcome, RouteOutcome::Delivered);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            bob.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(bob.engine.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_call_to_offline_peer_keeps_ringing() {
        let hub = Arc::new(PresenceHub::new(64));
        let (alice, _guard) = peer_on_hub(&hub, "alice");

        alice.engine.initiate(UserId::new("nobody")).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(
            alice.engine.state(),
            CallState::Ringing {
                peer: UserId::new("nobody")
            }
        );
    }
}
