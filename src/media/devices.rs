//! Mikrofon-Zugriff
//!
//! `MediaDevices` ist die Schnittstelle zur berechtigten Mikrofon-Aufnahme.
//! `CpalDevices` öffnet das Default-Eingabegerät über cpal; der Input-Stream
//! lebt auf einem eigenen Thread, bis alle Tracks gestoppt werden.

use super::stream::{MediaError, MediaStream};
use crate::audio::codec::downmix;
use crate::audio::output::select_best_config;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::BuildStreamError;
use tokio::sync::oneshot;

/// Bevorzugte Aufnahme-Rate (48kHz ist der Standard für beste Qualität)
pub const CAPTURE_SAMPLE_RATE: u32 = 48000;

// ============================================================================
// TRAIT
// ============================================================================

/// Quelle für Live-Mikrofonstreams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fordert das Mikrofon an
    ///
    /// Schlägt mit `PermissionDenied` bzw. `NoInputDevice` fehl, wenn kein
    /// Zugriff möglich ist.
    async fn get_user_media(&self) -> Result<MediaStream, MediaError>;
}

// ============================================================================
// CPAL DEVICES
// ============================================================================

/// Mikrofon über den cpal Default-Host
#[derive(Debug, Clone)]
pub struct CpalDevices {
    preferred_rate: u32,
}

impl CpalDevices {
    pub fn new() -> Self {
        Self {
            preferred_rate: CAPTURE_SAMPLE_RATE,
        }
    }

    pub fn with_sample_rate(preferred_rate: u32) -> Self {
        Self { preferred_rate }
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn get_user_media(&self) -> Result<MediaStream, MediaError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<MediaStream, MediaError>>();
        let preferred_rate = self.preferred_rate;

        std::thread::Builder::new()
            .name("voicelink-capture".to_string())
            .spawn(move || run_capture(preferred_rate, ready_tx))
            .map_err(|e| MediaError::StreamBuildError(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| MediaError::StreamBuildError("capture thread exited".to_string()))?
    }
}

/// Thread-Rumpf: Stream bauen, melden, bis zum Track-Stop halten
fn run_capture(preferred_rate: u32, ready: oneshot::Sender<Result<MediaStream, MediaError>>) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        tracing::warn!("No audio input device found");
        let _ = ready.send(Err(MediaError::NoInputDevice));
        return;
    };

    let config = match device.supported_input_configs() {
        Ok(configs) => match select_best_config(configs.collect(), preferred_rate) {
            Some(config) => config,
            None => {
                let _ = ready.send(Err(MediaError::UnsupportedConfig(
                    "No suitable audio configuration found".to_string(),
                )));
                return;
            }
        },
        Err(e) => {
            let _ = ready.send(Err(MediaError::UnsupportedConfig(e.to_string())));
            return;
        }
    };

    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let media = MediaStream::with_release("microphone", sample_rate, move || {
        let _ = stop_tx.send(());
    });

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        sample_rate,
        channels
    );

    let sink = media.clone();
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            sink.push(&downmix(data, channels));
        },
        |err| {
            tracing::error!("Audio capture error: {}", err);
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(map_build_error(e)));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(MediaError::StreamPlayError(e.to_string())));
        return;
    }

    if ready.send(Ok(media)).is_err() {
        // Anfrage wurde abgebrochen
        return;
    }

    let _ = stop_rx.blocking_recv();
    drop(stream);
    tracing::info!("Audio capture released");
}

fn map_build_error(err: BuildStreamError) -> MediaError {
    match err {
        BuildStreamError::DeviceNotAvailable => MediaError::NoInputDevice,
        BuildStreamError::BackendSpecific { err } => {
            if err.description.to_lowercase().contains("permission") {
                MediaError::PermissionDenied
            } else {
                MediaError::StreamBuildError(err.description)
            }
        }
        other => MediaError::StreamBuildError(other.to_string()),
    }
}
