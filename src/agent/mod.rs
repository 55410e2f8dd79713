//! Agent Module - Echtzeit-Audio mit einem Sprachagenten
//!
//! Dieses Modul verwaltet:
//! - Die Live-Session Schnittstellen und das Nachrichtenformat
//! - Gemini Live als konkreten Transport
//! - Input Streaming (feste Blöcke, nicht blockierende Queue)
//! - Den Agent Session Manager mit Playback Schedule

mod gemini;
mod input;
mod manager;
pub mod messages;
mod transport;

pub use gemini::{GeminiLiveSession, GeminiLiveTransport, GEMINI_LIVE_ENDPOINT};
pub use input::{INPUT_FRAME_SIZE, OUTBOUND_QUEUE_CAPACITY};
pub use manager::{
    AgentCallbacks, AgentOptions, AgentSessionManager, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
    UNKNOWN_ERROR,
};
pub use messages::{LiveServerMessage, MediaBlob};
pub use transport::{AgentError, AgentTransport, LiveConfig, LiveEvent, LiveSession};
