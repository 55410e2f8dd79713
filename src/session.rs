//! Session-Zustand und Fehler-Taxonomie der Session Manager

use crate::call::TransportError;
use crate::media::MediaError;
use thiserror::Error;

// ============================================================================
// SESSION STATE
// ============================================================================

/// Lebenszyklus einer Session
///
/// `Idle → Connecting → Active → Closed`; `Active → Idle` per explizitem Stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Keine Session
    #[default]
    Idle,
    /// Aufbau läuft
    Connecting,
    /// Audio fließt
    Active,
    /// Von der Gegenstelle oder per Shutdown beendet
    Closed,
}

impl SessionState {
    /// Läuft gerade ein Aufbau oder eine aktive Session?
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler des Call Session Managers
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Mikrofon verweigert oder nicht vorhanden (vom Nutzer behebbar)
    #[error("Microphone unavailable: {0}")]
    Permission(#[from] MediaError),

    /// Signaling/Transport nicht erreichbar oder abgelehnt
    #[error("Connection failed: {0}")]
    Connection(TransportError),

    /// Asynchroner Fehler der Gegenseite
    #[error("Remote error: {0}")]
    Remote(TransportError),

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error("Not registered with the signaling server")]
    NotRegistered,

    /// Session wurde während des Vorgangs beendet
    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

// ============================================================================
// TESTS
// ============================================================================
