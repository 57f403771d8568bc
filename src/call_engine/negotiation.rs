//! Negotiation-Primitive (SDP Offer/Answer + Trickle ICE)
//!
//! Für die Engine ist die Negotiation eine opake Capability. Ereignisse
//! (gesammelte Candidates, Connectivity, Remote-Tracks) meldet sie über einen
//! beim Erzeugen übergebenen Handler.

use super::media::{LocalStream, RemoteStream};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Negotiation backend error: {0}")]
    Backend(String),
}

/// Connectivity der Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Ereignisse der Negotiation
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// Lokal gesammelter ICE Candidate (sofort weiterleiten)
    LocalCandidate(IceCandidate),
    ConnectivityChanged(ConnectivityState),
    RemoteTrack(RemoteStream),
}

pub type NegotiationEventHandler = Arc<dyn Fn(NegotiationEvent) + Send + Sync>;

/// Eine Negotiation pro Anruf
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError>;

    /// Erstellt das Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Erstellt das Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self);
}

/// Erzeugt Negotiations (Plattform-Collaborator)
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(
        &self,
        handler: NegotiationEventHandler,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError>;
}
