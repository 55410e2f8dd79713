//! P2P-Transport Schnittstellen
//!
//! Ein `PeerTransport` registriert eine frei wählbare Peer-ID beim
//! Signaling; die `PeerRegistration` meldet `Open`, eingehende Anrufe und
//! Fehler als Events. Ein `MediaCall` meldet den entfernten Stream, das Ende
//! und Fehler. Alle Events laufen über `EventEmitter` mit expliziten
//! Subscription-Handles.

use crate::events::Subscription;
use crate::media::MediaStream;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer id '{0}' is already taken")]
    IdTaken(String),

    #[error("Signaling server unreachable: {0}")]
    Unreachable(String),

    #[error("Peer '{0}' is unavailable")]
    PeerUnavailable(String),

    /// Verbindung war beim Annehmen bereits stabil (harmloses Rennen)
    #[error("Connection already stable")]
    AlreadyStable,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Not registered")]
    NotRegistered,

    #[error("Transport closed")]
    Closed,

    #[error("Server error: {code} - {message}")]
    Server { code: i32, message: String },
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events einer Registrierung
#[derive(Clone)]
pub enum PeerEvent {
    /// Registrierung bestätigt
    Open { id: String },
    /// Eingehender Anruf
    Call(Arc<dyn MediaCall>),
    /// Asynchroner Fehler (z.B. ID vergeben, Server nicht erreichbar)
    Error(TransportError),
    /// Verbindung zum Signaling verloren
    Disconnected,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Open { id } => f.debug_struct("Open").field("id", id).finish(),
            PeerEvent::Call(call) => f.debug_tuple("Call").field(&call.peer()).finish(),
            PeerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            PeerEvent::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Events eines Anrufs
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Entfernter Audiostream ist da
    Stream(MediaStream),
    /// Anruf beendet
    Close,
    /// Fehler auf dem Anruf
    Error(TransportError),
}

pub type PeerHandler = Box<dyn Fn(&PeerEvent) + Send + Sync>;
pub type CallHandler = Box<dyn Fn(&CallEvent) + Send + Sync>;

// ============================================================================
// TRAITS
// ============================================================================

/// Signaling-vermittelter P2P-Transport
pub trait PeerTransport: Send + Sync {
    /// Erstellt eine noch nicht verbundene Registrierung für `local_id`
    fn register(&self, local_id: &str) -> Arc<dyn PeerRegistration>;
}

/// Registrierung einer Peer-ID
#[async_trait]
pub trait PeerRegistration: Send + Sync {
    fn id(&self) -> &str;

    /// Registriert einen Event-Handler
    fn on(&self, handler: PeerHandler) -> Subscription;

    /// Startet die Registrierung; Ergebnis kommt als `Open` oder `Error`
    fn connect(&self);

    /// Ruft `remote_id` mit dem lokalen Stream an
    async fn call(
        &self,
        remote_id: &str,
        stream: MediaStream,
    ) -> Result<Arc<dyn MediaCall>, TransportError>;

    /// Gibt die Registrierung und alle Anrufe frei. Idempotent.
    fn destroy(&self);
}

/// Ein einzelner Anruf
#[async_trait]
pub trait MediaCall: Send + Sync {
    /// Peer-ID der Gegenstelle
    fn peer(&self) -> &str;

    fn on(&self, handler: CallHandler) -> Subscription;

    /// Nimmt den Anruf mit dem lokalen Stream an
    async fn answer(&self, stream: MediaStream) -> Result<(), TransportError>;

    /// Beendet den Anruf. Idempotent.
    fn close(&self);
}
