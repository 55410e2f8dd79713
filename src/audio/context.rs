//! Audio-Kontexte: Uhr, Mischung und geplante Puffer
//!
//! `MixerContext` ist der Software-Kontext hinter jedem `AudioContext`:
//! eine Sample-genaue Uhr, eine Master-Gain (Mixing-Knoten), geplante
//! Buffer-Quellen mit Startzeitpunkt und ein Tap auf das gemischte Signal,
//! der vor der Ausgabe abgegriffen wird.

use super::codec::resample_linear;
use super::AudioFrame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifiziert eine geplante Buffer-Quelle
pub type SourceId = u64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio context is closed")]
    ContextClosed,
}

// ============================================================================
// AUDIO BUFFER
// ============================================================================

/// Dekodierter Mono-Puffer mit eigener Sample-Rate
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: Arc::from(samples),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Dauer in Sekunden
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Wofür ein Kontext geöffnet wird
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Nur Uhr/Resampling-Ziel für den Mikrofon-Uplink
    Capture,
    /// Mit physischer Ausgabe
    Playback,
}

/// Audio-Verarbeitungskontext mit eigener Uhr
pub trait AudioContext: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Aktuelle Position der Ausgabe-Uhr in Sekunden
    fn current_time(&self) -> f64;

    /// Plant einen Puffer für `when` (Sekunden auf der Kontext-Uhr)
    fn start_source(&self, buffer: AudioBuffer, when: f64) -> SourceId;

    /// Stoppt eine geplante oder laufende Quelle. Unbekannte IDs sind ein No-op.
    fn stop_source(&self, id: SourceId);

    /// Anzahl noch nicht beendeter Quellen
    fn active_sources(&self) -> usize;

    /// Abgriff des gemischten Signals vor der Ausgabe (für Metering)
    fn output_tap(&self) -> broadcast::Receiver<AudioFrame>;

    fn set_gain(&self, gain: f32);

    /// Schließt den Kontext. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Host-Audio-Fabrik
pub trait AudioHost: Send + Sync {
    fn create_context(
        &self,
        sample_rate: u32,
        kind: ContextKind,
    ) -> Result<Arc<dyn AudioContext>, AudioError>;
}

// ============================================================================
// MIXER CONTEXT
// ============================================================================

struct ScheduledSource {
    id: SourceId,
    samples: Arc<[f32]>,
    start_frame: u64,
}

struct MixerState {
    frames_rendered: u64,
    gain: f32,
    sources: Vec<ScheduledSource>,
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Software-Kontext; `render` treibt die Uhr voran
pub struct MixerContext {
    sample_rate: u32,
    state: Mutex<MixerState>,
    next_id: AtomicU64,
    closed: AtomicBool,
    tap: broadcast::Sender<AudioFrame>,
    on_close: Mutex<Option<CloseHook>>,
}

impl MixerContext {
    pub fn new(sample_rate: u32) -> Self {
        let (tap, _) = broadcast::channel(64);
        Self {
            sample_rate,
            state: Mutex::new(MixerState {
                frames_rendered: 0,
                gain: 1.0,
                sources: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tap,
            on_close: Mutex::new(None),
        }
    }

    /// Hook, der beim Schließen einmalig läuft (z.B. Ausgabegerät freigeben)
    pub fn set_close_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_close.lock() = Some(Box::new(hook));
    }

    /// Mischt die nächsten `out.len()` Frames und rückt die Uhr vor
    pub fn render(&self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock();
            let block_start = state.frames_rendered;
            let block_end = block_start + out.len() as u64;
            let gain = state.gain;

            for source in &state.sources {
                let source_end = source.start_frame + source.samples.len() as u64;
                if source_end <= block_start || source.start_frame >= block_end {
                    continue;
                }
                let from = source.start_frame.max(block_start);
                let to = source_end.min(block_end);
                for frame in from..to {
                    let sample = source.samples[(frame - source.start_frame) as usize];
                    out[(frame - block_start) as usize] += sample * gain;
                }
            }

            state
                .sources
                .retain(|s| s.start_frame + s.samples.len() as u64 > block_end);
            state.frames_rendered = block_end;
        }

        let _ = self.tap.send(Arc::from(&*out));
    }

    pub fn frames_rendered(&self) -> u64 {
        self.state.lock().frames_rendered
    }
}

impl AudioContext for MixerContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.state.lock().frames_rendered as f64 / self.sample_rate as f64
    }

    fn start_source(&self, buffer: AudioBuffer, when: f64) -> SourceId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || buffer.is_empty() {
            return id;
        }

        let samples: Arc<[f32]> = if buffer.sample_rate() == self.sample_rate {
            Arc::clone(&buffer.samples)
        } else {
            Arc::from(resample_linear(
                buffer.samples(),
                buffer.sample_rate(),
                self.sample_rate,
            ))
        };

        let mut state = self.state.lock();
        // Startzeiten in der Vergangenheit spielen sofort
        let requested = (when.max(0.0) * self.sample_rate as f64).round() as u64;
        let start_frame = requested.max(state.frames_rendered);
        state.sources.push(ScheduledSource {
            id,
            samples,
            start_frame,
        });
        id
    }

    fn stop_source(&self, id: SourceId) {
        self.state.lock().sources.retain(|s| s.id != id);
    }

    fn active_sources(&self) -> usize {
        self.state.lock().sources.len()
    }

    fn output_tap(&self) -> broadcast::Receiver<AudioFrame> {
        self.tap.subscribe()
    }

    fn set_gain(&self, gain: f32) {
        self.state.lock().gain = gain.max(0.0);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().sources.clear();
        if let Some(hook) = self.on_close.lock().take() {
            hook();
        }
        tracing::debug!("Audio context ({} Hz) closed", self.sample_rate);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MixerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixerContext")
            .field("sample_rate", &self.sample_rate)
            .field("current_time", &self.current_time())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 12000], 24000);
        assert_eq!(buffer.duration(), 0.5);
    }

    #[test]
    fn test_render_advances_clock() {
        let ctx = MixerContext::new(100);
        let mut out = vec![0.0; 50];
        ctx.render(&mut out);
        assert_eq!(ctx.current_time(), 0.5);
    }

    #[test]
    fn test_source_plays_at_start_time() {
        let ctx = MixerContext::new(10);
        ctx.start_source(AudioBuffer::new(vec![1.0; 5], 10), 0.5);

        let mut out = vec![0.0; 10];
        ctx.render(&mut out);

        assert_eq!(&out[..5], &[0.0; 5]);
        assert_eq!(&out[5..], &[1.0; 5]);
        // Quelle ist ausgespielt
        assert_eq!(ctx.active_sources(), 0);
    }

    #[test]
    fn test_sources_mix_with_gain() {
        let ctx = MixerContext::new(10);
        ctx.set_gain(0.5);
        ctx.start_source(AudioBuffer::new(vec![0.4; 4], 10), 0.0);
        ctx.start_source(AudioBuffer::new(vec![0.4; 4], 10), 0.0);

        let mut out = vec![0.0; 4];
        ctx.render(&mut out);
        assert!(out.iter().all(|s| (*s - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_stop_source_silences_it() {
        let ctx = MixerContext::new(10);
        let id = ctx.start_source(AudioBuffer::new(vec![1.0; 20], 10), 0.0);

        let mut out = vec![0.0; 5];
        ctx.render(&mut out);
        ctx.stop_source(id);
        ctx.render(&mut out);

        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(ctx.active_sources(), 0);
    }

    #[test]
    fn test_past_start_time_plays_immediately() {
        let ctx = MixerContext::new(10);
        let mut out = vec![0.0; 10];
        ctx.render(&mut out);

        ctx.start_source(AudioBuffer::new(vec![1.0; 2], 10), 0.0);
        ctx.render(&mut out);
        assert_eq!(&out[..2], &[1.0, 1.0]);
    }

    #[test]
    fn test_buffer_is_resampled_to_context_rate() {
        let ctx = MixerContext::new(20);
        ctx.start_source(AudioBuffer::new(vec![1.0; 10], 10), 0.0);

        let mut out = vec![0.0; 30];
        ctx.render(&mut out);
        assert_eq!(out.iter().filter(|s| **s > 0.0).count(), 20);
    }

    #[test]
    fn test_close_runs_hook_once_and_silences() {
        let ctx = MixerContext::new(10);
        let closed = Arc::new(AtomicU64::new(0));
        let closed_clone = Arc::clone(&closed);
        ctx.set_close_hook(move || {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });
        ctx.start_source(AudioBuffer::new(vec![1.0; 10], 10), 0.0);

        ctx.close();
        ctx.close();

        let mut out = vec![0.0; 10];
        ctx.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_output_tap_sees_mixed_signal() {
        let ctx = MixerContext::new(10);
        let mut tap = ctx.output_tap();
        ctx.start_source(AudioBuffer::new(vec![0.3; 4], 10), 0.0);

        let mut out = vec![0.0; 4];
        ctx.render(&mut out);

        let frame = tap.recv().await.unwrap();
        assert_eq!(frame.len(), 4);
        assert!((frame[0] - 0.3).abs() < 1e-6);
    }
}
