//! Presence Set und identitätsbasiertes Routing
//!
//! Der Hub hält keinen Call-State, nur die Zuordnung Identität → Verbindung.
//! Alle Änderungen am Presence Set laufen durch einen einzigen kritischen
//! Abschnitt; Zustellung erfolgt über `try_send` und blockiert nie.

use crate::signaling::{ServerMessage, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

/// Eindeutige ID einer Verbindung (monoton steigend)
pub type ConnectionId = u64;

// ============================================================================
// CONNECTION HANDLE
// ============================================================================

/// Ergebnis einer Zustellung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// In die Ausgangs-Queue des Ziels gelegt
    Delivered,
    /// Ziel ist nicht verbunden, Nachricht verworfen
    Offline,
    /// Ausgangs-Queue des Ziels ist voll, Nachricht verworfen
    Backpressured,
    /// Verbindung des Ziels wird gerade abgebaut
    Closed,
}

/// Live-Verbindung einer Identität
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: UserId,
    outbound: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    /// Legt eine Nachricht in die Ausgangs-Queue, ohne zu warten
    pub fn deliver(&self, message: ServerMessage) -> RouteOutcome {
        match self.outbound.try_send(message) {
            Ok(()) => RouteOutcome::Delivered,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Outbound queue full for {} (conn {}), dropping message",
                    self.identity,
                    self.id
                );
                RouteOutcome::Backpressured
            }
            Err(TrySendError::Closed(_)) => RouteOutcome::Closed,
        }
    }
}

// ============================================================================
// PRESENCE HUB
// ============================================================================

/// Presence Set plus Routing nach Ziel-Identität
pub struct PresenceHub {
    presence: Mutex<HashMap<UserId, ConnectionHandle>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    membership_tx: watch::Sender<Vec<UserId>>,
}

impl PresenceHub {
    /// Erstellt einen leeren Hub; `queue_capacity` begrenzt die
    /// Ausgangs-Queue pro Verbindung
    pub fn new(queue_capacity: usize) -> Self {
        let (membership_tx, _) = watch::channel(Vec::new());

        Self {
            presence: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            membership_tx,
        }
    }

    /// Erzeugt Handle und Ausgangs-Queue für eine zugelassene Identität.
    ///
    /// Das Handle ist noch nicht im Presence Set; erst [`PresenceHub::admit`]
    /// macht es routbar.
    pub fn connect(&self, identity: UserId) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(self.queue_capacity);
        let handle = ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            identity,
            outbound,
        };
        (handle, rx)
    }

    /// Registriert das Handle (last connection wins) und verteilt den neuen
    /// Membership-Snapshot an alle verbundenen Handles.
    ///
    /// Der zurückgegebene Guard entfernt den Eintrag beim Drop wieder.
    pub fn admit(self: &Arc<Self>, handle: ConnectionHandle) -> PresenceGuard {
        let guard = PresenceGuard {
            hub: Arc::clone(self),
            identity: handle.identity.clone(),
            connection_id: handle.id,
        };

        let mut presence = self.presence.lock();
        if let Some(previous) = presence.insert(handle.identity.clone(), handle) {
            tracing::info!(
                "Connection {} of {} superseded by connection {}",
                previous.id,
                guard.identity,
                guard.connection_id
            );
        }
        tracing::info!(
            "{} online (conn {}, total: {})",
            guard.identity,
            guard.connection_id,
            presence.len()
        );
        self.broadcast_locked(&presence);

        guard
    }

    /// Entfernt die Identität, sofern noch genau diese Verbindung registriert
    /// ist. Gibt `true` zurück, wenn ein Eintrag entfernt wurde.
    pub fn remove(&self, identity: &UserId, connection_id: ConnectionId) -> bool {
        let mut presence = self.presence.lock();

        let is_current = presence
            .get(identity)
            .is_some_and(|handle| handle.id == connection_id);
        if !is_current {
            tracing::debug!(
                "Ignoring stale disconnect of {} (conn {})",
                identity,
                connection_id
            );
            return false;
        }

        presence.remove(identity);
        tracing::info!(
            "{} offline (conn {}, remaining: {})",
            identity,
            connection_id,
            presence.len()
        );
        self.broadcast_locked(&presence);
        true
    }

    /// Leitet eine Nachricht an die aktuelle Verbindung des Ziels weiter.
    ///
    /// Fire-and-forget: ist das Ziel nicht verbunden, wird die Nachricht
    /// verworfen und der Absender nicht informiert.
    pub fn route(&self, destination: &UserId, message: ServerMessage) -> RouteOutcome {
        let presence = self.presence.lock();
        match presence.get(destination) {
            Some(handle) => handle.deliver(message),
            None => {
                tracing::debug!("Dropping message for offline user {}", destination);
                RouteOutcome::Offline
            }
        }
    }

    /// Aktuelle Membership, sortiert
    pub fn snapshot(&self) -> Vec<UserId> {
        Self::sorted_identities(&self.presence.lock())
    }

    pub fn is_online(&self, identity: &UserId) -> bool {
        self.presence.lock().contains_key(identity)
    }

    /// Membership-Snapshots für den Rest der Anwendung (Online-Status)
    pub fn membership(&self) -> watch::Receiver<Vec<UserId>> {
        self.membership_tx.subscribe()
    }

    fn broadcast_locked(&self, presence: &HashMap<UserId, ConnectionHandle>) {
        let snapshot = Self::sorted_identities(presence);
        for handle in presence.values() {
            handle.deliver(ServerMessage::OnlineUsers {
                user_ids: snapshot.clone(),
            });
        }
        self.membership_tx.send_replace(snapshot);
    }

    fn sorted_identities(presence: &HashMap<UserId, ConnectionHandle>) -> Vec<UserId> {
        let mut identities: Vec<UserId> = presence.keys().cloned().collect();
        identities.sort();
        identities
    }
}

impl std::fmt::Debug for PresenceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceHub")
            .field("online", &self.snapshot())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

// ============================================================================
// PRESENCE GUARD
// ============================================================================

/// Lebenszyklus einer zugelassenen Verbindung.
///
/// Trägt Identität und Verbindungs-ID explizit; beim Drop wird
/// [`PresenceHub::remove`] mit genau diesen Werten aufgerufen, sodass eine
/// abgelöste Verbindung nie den neueren Eintrag entfernt.
pub struct PresenceGuard {
    hub: Arc<PresenceHub>,
    identity: UserId,
    connection_id: ConnectionId,
}

impl PresenceGuard {
    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.hub.remove(&self.identity, self.connection_id);
    }
}

// ============================================================================
// TESTS
// ============================================================================
