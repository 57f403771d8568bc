//! Message Types für das Signaling-Protokoll
//!
//! Gemeinsamer Vertrag zwischen Presence Hub und Call Session Machine.
//! Der Hub interpretiert die Payloads nicht: er stempelt nur die Absender-
//! Identität und adressiert die Nachricht an das Ziel um.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// IDENTITY
// ============================================================================

/// Stabile User-ID, Routing-Schlüssel für alle Signaling-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Art einer Session Description (`RTCSdpType`).
///
/// Unbekannte Werte bleiben als [`SdpKind::Other`] erhalten, damit der Hub
/// sie unverändert weiterreicht.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
    Other(String),
}

impl SdpKind {
    pub fn as_str(&self) -> &str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
            SdpKind::Other(kind) => kind,
        }
    }
}

impl From<String> for SdpKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "offer" => SdpKind::Offer,
            "answer" => SdpKind::Answer,
            "pranswer" => SdpKind::Pranswer,
            "rollback" => SdpKind::Rollback,
            _ => SdpKind::Other(kind),
        }
    }
}

impl From<SdpKind> for String {
    fn from(kind: SdpKind) -> Self {
        match kind {
            SdpKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

/// SDP Offer/Answer im JSON-Format des Browsers (`{type, sdp}`).
///
/// Zusätzliche Felder landen in `extra` und werden mit weitergeleitet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
            extra: Map::new(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
            extra: Map::new(),
        }
    }
}

/// ICE Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// CLIENT → HUB MESSAGES
// ============================================================================

/// Signierte Anmeldung, erste Nachricht jeder Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub timestamp: i64,
    pub signature: String,
}

impl Hello {
    /// Bytes, über die die Hello-Signatur gebildet wird
    pub fn signing_payload(user_id: &UserId, timestamp: i64) -> String {
        format!("callwire-hello:{}:{}", user_id, timestamp)
    }
}

/// Alle Nachrichten, die ein Client an den Hub sendet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Anmeldung (nur als erste Nachricht gültig)
    Hello(Hello),

    /// Anruf starten (Caller → Callee)
    CallInitiate {
        to: UserId,
        offer: SessionDescription,
        #[serde(rename = "callerName")]
        caller_name: String,
        #[serde(rename = "callerPic", default, skip_serializing_if = "Option::is_none")]
        caller_pic: Option<String>,
    },

    /// Anruf annehmen (Callee → Caller)
    CallAccept {
        to: UserId,
        answer: SessionDescription,
    },

    /// Anruf ablehnen (Callee → Caller)
    CallReject { to: UserId },

    /// Auflegen (beide Richtungen)
    CallEnd { to: UserId },

    /// Trickle ICE (beide Richtungen)
    IceCandidate { to: UserId, candidate: IceCandidate },

    /// Heartbeat
    Heartbeat,
}

impl ClientMessage {
    /// Adressiert eine Signaling-Nachricht für die Weiterleitung um.
    ///
    /// Gibt das Ziel und die an das Ziel zu sendende Nachricht zurück, wobei
    /// `from` als Absender eingesetzt wird. `Hello` und `Heartbeat` werden
    /// nicht weitergeleitet.
    pub fn into_relay(self, from: &UserId) -> Option<(UserId, ServerMessage)> {
        let from = from.clone();
        let routed = match self {
            ClientMessage::CallInitiate {
                to,
                offer,
                caller_name,
                caller_pic,
            } => (
                to,
                ServerMessage::CallIncoming {
                    caller_id: from,
                    caller_name,
                    caller_pic,
                    offer,
                },
            ),
            ClientMessage::CallAccept { to, answer } => {
                (to, ServerMessage::CallAccepted { from, answer })
            }
            ClientMessage::CallReject { to } => (to, ServerMessage::CallRejected { from }),
            ClientMessage::CallEnd { to } => (to, ServerMessage::CallEnded { from }),
            ClientMessage::IceCandidate { to, candidate } => {
                (to, ServerMessage::IceCandidate { from, candidate })
            }
            ClientMessage::Hello(_) | ClientMessage::Heartbeat => return None,
        };
        Some(routed)
    }
}

// ============================================================================
// HUB → CLIENT MESSAGES
// ============================================================================

/// Fehlercodes in `ServerMessage::Error`
pub mod error_code {
    /// Nachricht konnte nicht geparst werden
    pub const MALFORMED: u16 = 400;
    /// Anmeldung abgelehnt
    pub const ADMISSION_REJECTED: u16 = 401;
    /// Keine Anmeldung innerhalb der Frist
    pub const ADMISSION_TIMEOUT: u16 = 408;
    /// Erste Nachricht war kein Hello
    pub const NOT_ADMITTED: u16 = 403;
}

/// Alle Nachrichten, die der Hub an Clients sendet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Anmeldung erfolgreich
    Welcome {
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    /// Membership-Snapshot: alle aktuell verbundenen Identitäten
    OnlineUsers {
        #[serde(rename = "userIds")]
        user_ids: Vec<UserId>,
    },

    /// Eingehender Anruf mit SDP Offer
    CallIncoming {
        #[serde(rename = "callerId")]
        caller_id: UserId,
        #[serde(rename = "callerName")]
        caller_name: String,
        #[serde(rename = "callerPic", default, skip_serializing_if = "Option::is_none")]
        caller_pic: Option<String>,
        offer: SessionDescription,
    },

    /// Gegenseite hat angenommen
    CallAccepted {
        from: UserId,
        answer: SessionDescription,
    },

    /// Gegenseite hat abgelehnt
    CallRejected { from: UserId },

    /// Gegenseite hat aufgelegt
    CallEnded { from: UserId },

    /// ICE Candidate der Gegenseite
    IceCandidate { from: UserId, candidate: IceCandidate },

    /// Heartbeat Antwort
    Pong,

    /// Fehler
    Error { code: u16, message: String },
}

impl ServerMessage {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
