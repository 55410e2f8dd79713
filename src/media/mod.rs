//! Media Module - lokale Aufnahme und Live-Streams
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Zugriff (berechtigt, einmal pro Session)
//! - MediaStreams als Frame-Bus für Metering und Uplink
//! - Track-Freigabe beim Stoppen

mod devices;
mod stream;

pub use devices::{CpalDevices, MediaDevices, CAPTURE_SAMPLE_RATE};
pub use stream::{AudioFrame, MediaError, MediaStream, MediaTrack};
