//! Agent-Transport Schnittstellen
//!
//! Ein `AgentTransport` öffnet eine bidirektionale Live-Session zum
//! entfernten Sprachagenten. Session-Events (`Open`, `Message`, `Close`,
//! `Error`) laufen über einen Kanal an den Manager; die Session selbst nimmt
//! nur noch Echtzeit-Eingaben entgegen.

use super::messages::{LiveServerMessage, MediaBlob};
use crate::audio::AudioError;
use crate::media::MediaError;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Agent connection failed: {0}")]
    Connection(String),

    #[error("Microphone unavailable: {0}")]
    Permission(#[from] MediaError),

    #[error("Audio output unavailable: {0}")]
    Audio(#[from] AudioError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Failed to send input: {0}")]
    Send(String),

    #[error("Session not connected")]
    NotConnected,

    /// Session wurde während des Aufbaus beendet
    #[error("Connect cancelled by disconnect")]
    Cancelled,
}

impl AgentError {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }
}

// ============================================================================
// CONFIG & EVENTS
// ============================================================================

/// Verhaltenskonfiguration des Agenten (wird unverändert durchgereicht)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    pub model: String,
    pub system_instruction: Option<String>,
    pub response_modality: String,
    pub voice_name: Option<String>,
}

/// Events einer Live-Session
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// Session ist bereit für Eingaben
    Open,
    /// Nachricht vom Agenten
    Message(LiveServerMessage),
    /// Session wurde beendet
    Close { reason: Option<String> },
    /// Asynchroner Fehler; `message` fehlt, wenn die Gegenseite keine liefert
    Error { message: Option<String> },
}

// ============================================================================
// TRAITS
// ============================================================================

/// Fabrik für Live-Sessions
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Öffnet eine Session; Events gehen an `events`
    async fn connect(
        &self,
        config: LiveConfig,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Arc<dyn LiveSession>, AgentError>;
}

/// Offene Live-Session
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Sendet einen Chunk Echtzeit-Eingabe
    async fn send_realtime_input(&self, blob: MediaBlob) -> Result<(), AgentError>;

    /// Baut den Socket ab (ohne Close-Nachricht auf Session-Ebene). Idempotent.
    fn close(&self);
}
