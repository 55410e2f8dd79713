//! MediaStream - Live-Audioquelle mit Track-Verwaltung
//!
//! Ein Stream verteilt Mono-Frames (f32, -1.0..1.0) über einen
//! broadcast-Kanal an beliebig viele Abnehmer (Analyser, Uplink, Encoder).
//! Das Stoppen der Tracks gibt die dahinterliegende Ressource frei.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Ein Block Mono-Samples
pub type AudioFrame = Arc<[f32]>;

/// Kapazität des Frame-Busses (Frames, nicht Samples)
const FRAME_BUS_CAPACITY: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Audio-Track eines Streams
pub struct MediaTrack {
    label: String,
    ended: AtomicBool,
    enabled: AtomicBool,
    release: Mutex<Option<ReleaseHook>>,
}

impl MediaTrack {
    fn new(label: String, release: Option<ReleaseHook>) -> Self {
        Self {
            label,
            ended: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            release: Mutex::new(release),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_live(&self) -> bool {
        !self.ended.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Deaktivierte Tracks liefern Stille (Mute)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Beendet den Track und gibt die Quelle frei. Mehrfacher Aufruf ist ein No-op.
    pub fn stop(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(release) = self.release.lock().take() {
            release();
        }
        tracing::debug!("Track '{}' stopped", self.label);
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("label", &self.label)
            .field("live", &self.is_live())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

struct StreamInner {
    id: String,
    sample_rate: u32,
    frames: broadcast::Sender<AudioFrame>,
    track: MediaTrack,
}

/// Live-Audiostream (Mikrofon oder Gegenstelle)
///
/// Klone teilen sich denselben Stream; `stop_tracks` wirkt auf alle.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    /// Erstellt einen Stream ohne Freigabe-Hook
    pub fn new(label: impl Into<String>, sample_rate: u32) -> Self {
        Self::build(label.into(), sample_rate, None)
    }

    /// Erstellt einen Stream, dessen Quelle beim Stoppen freigegeben wird
    pub fn with_release<F>(label: impl Into<String>, sample_rate: u32, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(label.into(), sample_rate, Some(Box::new(release)))
    }

    fn build(label: String, sample_rate: u32, release: Option<ReleaseHook>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_BUS_CAPACITY);
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                sample_rate,
                frames,
                track: MediaTrack::new(label, release),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn track(&self) -> &MediaTrack {
        &self.inner.track
    }

    pub fn is_live(&self) -> bool {
        self.inner.track.is_live()
    }

    /// Neuer Abnehmer für die Frames dieses Streams
    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.frames.subscribe()
    }

    /// Speist einen Frame ein (von der Quelle aufgerufen)
    ///
    /// Gibt `false` zurück, wenn der Track bereits beendet ist.
    pub fn push(&self, samples: &[f32]) -> bool {
        if !self.is_live() {
            return false;
        }
        let frame: AudioFrame = if self.inner.track.is_enabled() {
            Arc::from(samples)
        } else {
            Arc::from(vec![0.0f32; samples.len()])
        };
        // Kein Abnehmer ist kein Fehler
        let _ = self.inner.frames.send(frame);
        true
    }

    /// Stoppt alle Tracks. Idempotent.
    pub fn stop_tracks(&self) {
        self.inner.track.stop();
    }

    /// Zwei Handles auf denselben Stream?
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("sample_rate", &self.inner.sample_rate)
            .field("track", &self.inner.track)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let released_clone = Arc::clone(&released);
        let stream = MediaStream::with_release("mic", 48000, move || {
            released_clone.fetch_add(1, Ordering::SeqCst);
        });

        stream.stop_tracks();
        stream.clone().stop_tracks();

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!stream.is_live());
    }

    #[tokio::test]
    async fn test_push_reaches_subscriber() {
        let stream = MediaStream::new("mic", 16000);
        let mut rx = stream.subscribe();

        assert!(stream.push(&[0.5, -0.5]));
        let frame = rx.recv().await.unwrap();
        assert_eq!(&*frame, &[0.5, -0.5]);
    }

    #[tokio::test]
    async fn test_disabled_track_pushes_silence() {
        let stream = MediaStream::new("mic", 16000);
        let mut rx = stream.subscribe();

        stream.track().set_enabled(false);
        stream.push(&[0.9, 0.9, 0.9]);

        let frame = rx.recv().await.unwrap();
        assert!(frame.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_push_after_stop_is_rejected() {
        let stream = MediaStream::new("mic", 16000);
        stream.stop_tracks();
        assert!(!stream.push(&[0.1]));
    }
}
