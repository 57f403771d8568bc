//! Konfiguration für Hub (Server) und Call Engine (Client)

use std::net::SocketAddr;
use std::time::Duration;

// ============================================================================
// HUB
// ============================================================================

/// Laufzeit-Konfiguration des Presence Hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: SocketAddr,
    /// Frist für das `Hello` nach dem WebSocket-Upgrade
    pub admission_timeout: Duration,
    /// Ausgangs-Queue pro Verbindung
    pub outbound_queue: usize,
    /// Erlaubte Uhrenabweichung für signierte Hellos
    pub max_clock_skew: Duration,
    /// Behauptete Identität ohne Signaturprüfung übernehmen (nur Entwicklung)
    pub insecure_identity: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8787)),
            admission_timeout: Duration::from_secs(10),
            outbound_queue: 256,
            max_clock_skew: Duration::from_secs(60),
            insecure_identity: false,
        }
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Standard STUN Server (Google, kostenlos)
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Konfiguration der Call Session Machine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wie lange ein eingehendes Angebot auf Annahme/Ablehnung wartet
    pub decision_timeout: Duration,
    /// Takt des Gesprächsdauer-Zählers
    pub duration_tick: Duration,
    /// Optionales Klingel-Limit auf Anruferseite. `None` entspricht dem
    /// Fire-and-forget-Verhalten des Hubs: ohne Antwort klingelt es, bis
    /// die Oberfläche auflegt.
    pub ring_timeout: Option<Duration>,
    /// ICE Server URLs für die Negotiation
    pub ice_servers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(30),
            duration_tick: Duration::from_secs(1),
            ring_timeout: None,
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
