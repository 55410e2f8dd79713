//! Audio Module - Audio-Graph für Metering und Wiedergabe
//!
//! Dieses Modul verwaltet:
//! - Audio-Kontexte mit eigener Uhr (Capture / Playback)
//! - Analyser-Taps für die Pegelmessung
//! - Den Playback Schedule für eingehende Chunks
//! - Sample-Konvertierung (PCM16, µ-law, Resampling)

mod analyser;
pub mod codec;
mod context;
mod meter;
pub(crate) mod output;
mod playback;

pub use crate::media::AudioFrame;
pub use analyser::{Analyser, MeteringGraph, FFT_SIZE};
pub use context::{
    AudioBuffer, AudioContext, AudioError, AudioHost, ContextKind, MixerContext, SourceId,
};
pub use meter::{VolumeCallback, VolumeMonitor, METER_INTERVAL};
pub use output::CpalHost;
pub use playback::PlaybackSchedule;
