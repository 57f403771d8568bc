//! Lokale Audio-Capability
//!
//! Die Plattform liefert das Mikrofon über eine [`MediaSource`]; die Engine
//! kennt nur Spuren mit Enabled-Flag und Stop.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Audio device unavailable: {0}")]
    Unavailable(String),
}

/// Eine lokale Audio-Spur
pub trait AudioTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Gibt das Gerät frei; danach ist die Spur unbrauchbar
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Lokaler Audio-Stream (Mikrofon), exklusiv im Besitz einer Session
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<dyn AudioTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn AudioTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn AudioTrack>] {
        &self.tracks
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Vom Peer empfangener Stream, wie ihn die Negotiation meldet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub track_ids: Vec<String>,
}

/// Quelle für lokales Audio (Plattform-Collaborator)
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fordert das Mikrofon an. Kann auf eine Benutzerfreigabe warten.
    async fn acquire_audio(&self) -> Result<LocalStream, MediaError>;
}

/// Audio-Spur mit atomaren Flags, Basis für Plattform-Adapter
pub struct BasicAudioTrack {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl BasicAudioTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl AudioTrack for BasicAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Audio track {} stopped", self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for BasicAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
