//! Cpal Host - Audio-Kontexte auf echter Hardware
//!
//! Capture-Kontexte sind reine Software-Uhren. Playback-Kontexte bekommen
//! einen cpal Output-Stream, dessen Callback den `MixerContext` rendert
//! (bei abweichender Geräte-Rate mit Linear-Resampling).
//!
//! cpal-Streams sind nicht `Send`; jeder Stream lebt daher auf einem eigenen
//! Thread, bis der Kontext geschlossen wird.

use super::context::{AudioContext, AudioError, AudioHost, ContextKind, MixerContext};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Maximale Anzahl Kontext-Frames, die pro Nachladen gerendert werden
const RENDER_CHUNK: usize = 4096;

// ============================================================================
// CPAL HOST
// ============================================================================

/// `AudioHost` auf Basis des cpal Default-Hosts
#[derive(Debug, Default, Clone)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

impl AudioHost for CpalHost {
    fn create_context(
        &self,
        sample_rate: u32,
        kind: ContextKind,
    ) -> Result<Arc<dyn AudioContext>, AudioError> {
        let mixer = Arc::new(MixerContext::new(sample_rate));

        if kind == ContextKind::Playback {
            let stop = spawn_output_thread(Arc::clone(&mixer))?;
            mixer.set_close_hook(move || {
                let _ = stop.send(());
            });
        }

        tracing::info!("Audio context created: {} Hz ({:?})", sample_rate, kind);
        Ok(mixer)
    }
}

/// Startet den Output-Stream auf einem eigenen Thread
///
/// Liefert den Stop-Sender zurück, sobald der Stream läuft.
fn spawn_output_thread(mixer: Arc<MixerContext>) -> Result<oneshot::Sender<()>, AudioError> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    std::thread::Builder::new()
        .name("voicelink-output".to_string())
        .spawn(move || {
            let stream = match build_output_stream(mixer) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Blockiert bis close() oder bis der Kontext fallengelassen wird
            let _ = stop_rx.blocking_recv();
            drop(stream);
            tracing::info!("Audio playback stopped");
        })
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    ready_rx
        .recv()
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))??;

    Ok(stop_tx)
}

fn build_output_stream(mixer: Arc<MixerContext>) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    let context_rate = mixer.sample_rate();
    let config = find_best_output_config(&device, context_rate)?;
    let device_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    tracing::info!(
        "Starting audio playback: {} Hz device, {} Hz context, {} channels",
        device_rate,
        context_rate,
        channels
    );

    let mut resampler = OutputResampler::new(context_rate, device_rate);
    let mut mono: Vec<f32> = Vec::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames_needed = data.len() / channels.max(1);
                mono.resize(frames_needed, 0.0);
                resampler.process(&mixer, &mut mono);

                // Mono auf alle Kanäle verteilen
                for (frame, sample) in data.chunks_mut(channels.max(1)).zip(&mono) {
                    frame.iter_mut().for_each(|s| *s = *sample);
                }
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok(stream)
}

// ============================================================================
// RESAMPLER
// ============================================================================

/// Fortlaufendes Linear-Resampling von Kontext- auf Geräte-Rate
///
/// Leseposition und noch nicht verbrauchte Kontext-Samples bleiben über
/// Callback-Grenzen erhalten. Blöcke schließen dadurch lückenlos aneinander
/// an und die Kontext-Uhr läuft mit der Geräte-Uhr mit.
struct OutputResampler {
    /// Kontext-Samples pro Geräte-Frame
    step: f64,
    passthrough: bool,
    /// Position zwischen `current` und `next`
    frac: f64,
    current: f32,
    next: f32,
    pending: HeapRb<f32>,
    scratch: Vec<f32>,
}

impl OutputResampler {
    fn new(context_rate: u32, device_rate: u32) -> Self {
        Self {
            step: context_rate as f64 / device_rate.max(1) as f64,
            passthrough: context_rate == device_rate,
            // Erste zwei Samples werden beim ersten Frame geladen
            frac: 2.0,
            current: 0.0,
            next: 0.0,
            pending: HeapRb::new(RENDER_CHUNK),
            scratch: Vec::with_capacity(RENDER_CHUNK),
        }
    }

    /// Füllt `out` (mono) und rendert dafür nur so viel wie nötig aus `mixer`
    fn process(&mut self, mixer: &MixerContext, out: &mut [f32]) {
        if self.passthrough {
            mixer.render(out);
            return;
        }

        let len = out.len();
        for (i, sample) in out.iter_mut().enumerate() {
            while self.frac >= 1.0 {
                self.frac -= 1.0;
                self.current = self.next;
                let remaining = ((len - i) as f64 * self.step).ceil() as usize + 1;
                self.next = self.pull(mixer, remaining);
            }
            *sample = self.current + (self.next - self.current) * self.frac as f32;
            self.frac += self.step;
        }
    }

    fn pull(&mut self, mixer: &MixerContext, wanted: usize) -> f32 {
        if let Some(sample) = self.pending.try_pop() {
            return sample;
        }

        self.scratch.resize(wanted.clamp(1, RENDER_CHUNK), 0.0);
        mixer.render(&mut self.scratch);
        for sample in &self.scratch {
            let _ = self.pending.try_push(*sample);
        }
        self.pending.try_pop().unwrap_or(0.0)
    }
}

// ============================================================================
// CONFIG SELECTION
// ============================================================================

fn find_best_output_config(device: &Device, target_rate: u32) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect(), target_rate)
        .ok_or_else(|| AudioError::UnsupportedConfig("No suitable audio configuration found".to_string()))
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: exakte Ziel-Rate mit F32, dann beliebige F32-Konfiguration,
/// sonst die erste verfügbare.
pub(crate) fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<StreamConfig> {
    let target = cpal::SampleRate(target_rate);
    let supports = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target && c.max_sample_rate() >= target
    };

    if let Some(config) = configs
        .iter()
        .find(|c| supports(c) && c.sample_format() == SampleFormat::F32)
    {
        return Some(config.clone().with_sample_rate(target).into());
    }

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
    {
        let rate = if supports(config) {
            target
        } else {
            config.max_sample_rate()
        };
        return Some(config.clone().with_sample_rate(rate).into());
    }

    configs
        .first()
        .map(|config| config.clone().with_max_sample_rate().into())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioBuffer;

    /// Kontext mit konstantem Signal über die ganze Testdauer
    fn constant_mixer(rate: u32) -> MixerContext {
        let mixer = MixerContext::new(rate);
        mixer.start_source(AudioBuffer::new(vec![0.5; rate as usize * 10], rate), 0.0);
        mixer
    }

    fn run_callbacks(context_rate: u32, device_rate: u32, block: usize, callbacks: usize) {
        let mixer = constant_mixer(context_rate);
        let mut resampler = OutputResampler::new(context_rate, device_rate);
        let mut out = vec![0.0; block];

        for _ in 0..callbacks {
            resampler.process(&mixer, &mut out);
            assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6), "gap in {:?}", out);
        }

        // Kontext-Uhr folgt der Geräte-Uhr, ohne Vorlauf über wenige Frames hinaus
        let expected = (block * callbacks) as f64 * context_rate as f64 / device_rate as f64;
        let rendered = mixer.frames_rendered() as f64;
        assert!(rendered >= expected, "{} < {}", rendered, expected);
        assert!(rendered - expected <= 3.0, "{} vs {}", rendered, expected);
    }

    #[test]
    fn test_upsampling_is_gap_free_across_callbacks() {
        run_callbacks(24000, 44100, 512, 200);
    }

    #[test]
    fn test_uneven_block_sizes_keep_clock() {
        run_callbacks(24000, 48000, 441, 200);
    }

    #[test]
    fn test_downsampling_is_gap_free_across_callbacks() {
        run_callbacks(24000, 16000, 160, 100);
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let mixer = constant_mixer(24000);
        let mut resampler = OutputResampler::new(24000, 24000);
        let mut out = vec![0.0; 480];
        resampler.process(&mixer, &mut out);

        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6));
        assert_eq!(mixer.frames_rendered(), 480);
    }
}
