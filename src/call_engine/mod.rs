//! Call Engine Module - Call Session Machine
//!
//! Dieses Modul verwaltet:
//! - Den Lebenszyklus eines Anrufs (Caller und Callee)
//! - Mikrofon-Zugriff über eine austauschbare Media Source
//! - SDP/ICE-Negotiation, standardmäßig über webrtc-rs

mod engine;
mod media;
mod negotiation;
mod rtc;

#[cfg(any(test, feature = "test-util"))]
pub mod fakes;

pub use engine::{
    format_duration, CallEngine, CallError, CallEvent, CallSnapshot, CallState, DismissReason,
    EndReason, IncomingCallOffer, LocalProfile,
};
pub use media::{AudioTrack, BasicAudioTrack, LocalStream, MediaError, MediaSource, RemoteStream};
pub use negotiation::{
    ConnectivityState, NegotiationError, NegotiationEvent, NegotiationEventHandler, Negotiator,
    NegotiatorFactory,
};
pub use rtc::{WebRtcNegotiator, WebRtcNegotiatorFactory};
