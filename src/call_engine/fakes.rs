//! Test-Doubles für Mikrofon, Negotiation und Signaling
//!
//! Nur mit `cfg(test)` oder dem Feature `test-util` verfügbar.

use super::media::{AudioTrack, BasicAudioTrack, LocalStream, MediaError, MediaSource, RemoteStream};
use super::negotiation::{
    ConnectivityState, NegotiationError, NegotiationEvent, NegotiationEventHandler, Negotiator,
    NegotiatorFactory,
};
use crate::hub::PresenceHub;
use crate::signaling::{
    ClientMessage, IceCandidate, SessionDescription, SignalSink, SignalingError, UserId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// SDP, das [`FakeNegotiator::set_remote_description`] ablehnt
pub const MALFORMED_SDP: &str = "malformed";

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum MediaMode {
    Grant,
    Deny,
    Unavailable(String),
}

/// Mikrofon mit steuerbarer Freigabe
pub struct FakeMediaSource {
    mode: Mutex<MediaMode>,
    tracks: usize,
    held: AtomicBool,
    gate: Notify,
    issued: Mutex<Vec<LocalStream>>,
}

impl FakeMediaSource {
    pub fn granting() -> Self {
        Self::with_mode(MediaMode::Grant)
    }

    pub fn denying() -> Self {
        Self::with_mode(MediaMode::Deny)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::with_mode(MediaMode::Unavailable(reason.into()))
    }

    fn with_mode(mode: MediaMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            tracks: 1,
            held: AtomicBool::new(false),
            gate: Notify::new(),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Jeder ausgegebene Stream enthält `tracks` Spuren
    pub fn with_tracks(mut self, tracks: usize) -> Self {
        self.tracks = tracks;
        self
    }

    /// Folgende Anfragen warten, bis [`release`](Self::release) aufgerufen wird
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    /// Alle bisher ausgegebenen Streams
    pub fn issued(&self) -> Vec<LocalStream> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire_audio(&self) -> Result<LocalStream, MediaError> {
        if self.held.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }

        let mode = self.mode.lock().clone();
        match mode {
            MediaMode::Grant => {
                let mut issued = self.issued.lock();
                let n = issued.len();
                let tracks = (0..self.tracks)
                    .map(|i| {
                        let id = match i {
                            0 => format!("mic-audio-{}", n),
                            _ => format!("mic-audio-{}-{}", n, i),
                        };
                        Arc::new(BasicAudioTrack::new(id)) as Arc<dyn AudioTrack>
                    })
                    .collect();
                let stream = LocalStream::new(format!("mic-{}", n), tracks);
                issued.push(stream.clone());
                Ok(stream)
            }
            MediaMode::Deny => Err(MediaError::PermissionDenied),
            MediaMode::Unavailable(reason) => Err(MediaError::Unavailable(reason)),
        }
    }
}

// ============================================================================
// NEGOTIATION
// ============================================================================

/// Erzeugt [`FakeNegotiator`]s und merkt sich alle
#[derive(Default)]
pub struct FakeNegotiatorFactory {
    created: Mutex<Vec<Arc<FakeNegotiator>>>,
    fail_next: AtomicBool,
    hold_candidates: AtomicBool,
}

impl FakeNegotiatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Die nächste `create`-Anfrage schlägt fehl
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Neue Negotiators halten `add_ice_candidate` an, bis
    /// [`FakeNegotiator::release_candidates`] aufgerufen wird
    pub fn hold_candidates(&self) {
        self.hold_candidates.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakeNegotiator>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeNegotiator>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl NegotiatorFactory for FakeNegotiatorFactory {
    async fn create(
        &self,
        handler: NegotiationEventHandler,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(NegotiationError::Backend("fake backend failure".into()));
        }

        let mut created = self.created.lock();
        let negotiator = Arc::new(FakeNegotiator::new(
            created.len(),
            handler,
            self.hold_candidates.load(Ordering::SeqCst),
        ));
        created.push(Arc::clone(&negotiator));
        Ok(negotiator)
    }
}

/// Negotiation ohne Netzwerk.
///
/// Beim Erstellen von Offer/Answer wird ein lokaler Candidate gemeldet;
/// Connectivity und Remote-Tracks steuert der Test.
pub struct FakeNegotiator {
    index: usize,
    handler: NegotiationEventHandler,
    local_streams: Mutex<Vec<String>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    candidates_held: AtomicBool,
    candidate_gate: Notify,
    emitted: AtomicUsize,
    closed: AtomicBool,
}

impl FakeNegotiator {
    fn new(index: usize, handler: NegotiationEventHandler, hold_candidates: bool) -> Self {
        Self {
            index,
            handler,
            local_streams: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            applied_candidates: Mutex::new(Vec::new()),
            candidates_held: AtomicBool::new(hold_candidates),
            candidate_gate: Notify::new(),
            emitted: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_connectivity(&self, state: ConnectivityState) {
        (self.handler)(NegotiationEvent::ConnectivityChanged(state));
    }

    pub fn emit_candidate(&self) -> IceCandidate {
        let n = self.emitted.fetch_add(1, Ordering::SeqCst);
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host",
                n, self.index, n
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            ..Default::default()
        };
        (self.handler)(NegotiationEvent::LocalCandidate(candidate.clone()));
        candidate
    }

    pub fn release_candidates(&self) {
        self.candidates_held.store(false, Ordering::SeqCst);
        self.candidate_gate.notify_waiters();
    }

    pub fn emit_remote_track(&self, stream: RemoteStream) {
        (self.handler)(NegotiationEvent::RemoteTrack(stream));
    }

    pub fn local_streams(&self) -> Vec<String> {
        self.local_streams.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError> {
        self.local_streams.lock().push(stream.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = SessionDescription::offer(format!("v=0 fake-offer-{}", self.index));
        *self.local_description.lock() = Some(offer.clone());
        self.emit_candidate();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.remote_description.lock().is_none() {
            return Err(NegotiationError::Backend("no remote offer".into()));
        }
        let answer = SessionDescription::answer(format!("v=0 fake-answer-{}", self.index));
        *self.local_description.lock() = Some(answer.clone());
        self.emit_candidate();
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if description.sdp == MALFORMED_SDP {
            return Err(NegotiationError::InvalidDescription(description.sdp));
        }
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        loop {
            let released = self.candidate_gate.notified();
            if !self.candidates_held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        if self.remote_description.lock().is_none() {
            return Err(NegotiationError::InvalidCandidate(
                "remote description not set".into(),
            ));
        }
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Zeichnet alle gesendeten Nachrichten auf
#[derive(Default)]
pub struct RecordingSignalSink {
    sent: Mutex<Vec<ClientMessage>>,
}

impl RecordingSignalSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SignalSink for RecordingSignalSink {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Leitet Nachrichten direkt über einen [`PresenceHub`] weiter, wie es die
/// Server-Schleife für eine angemeldete Verbindung tut
pub struct LoopbackSink {
    hub: Arc<PresenceHub>,
    from: UserId,
}

impl LoopbackSink {
    pub fn new(hub: Arc<PresenceHub>, from: UserId) -> Self {
        Self { hub, from }
    }
}

impl SignalSink for LoopbackSink {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if let Some((to, relayed)) = message.into_relay(&self.from) {
            let outcome = self.hub.route(&to, relayed);
            tracing::debug!("Loopback {} -> {}: {:?}", self.from, to, outcome);
        }
        Ok(())
    }
}
