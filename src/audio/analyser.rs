//! Analyser - grobe Lautstärke-Messung über ein kleines FFT-Fenster
//!
//! Nachbildung eines Frequenz-Analyse-Knotens: Blackman-Fenster, FFT,
//! zeitliche Glättung und Abbildung der dB-Werte auf 0..255.
//! Mit 32 Samples reicht die Auflösung nur für Pegel, nicht für Spektren.

use super::AudioFrame;
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

// ============================================================================
// CONSTANTS
// ============================================================================

/// FFT-Fenstergröße der Metering-Taps
pub const FFT_SIZE: usize = 32;

const SMOOTHING_TIME_CONSTANT: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

// ============================================================================
// ANALYSER
// ============================================================================

struct AnalyserState {
    window: HeapRb<f32>,
    smoothed: Vec<f32>,
}

/// Metering-Tap auf einem Audiosignal
pub struct Analyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    state: Arc<Mutex<AnalyserState>>,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl Analyser {
    /// Erstellt einen Analyser ohne Quelle
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            fft,
            state: Arc::new(Mutex::new(AnalyserState {
                window: HeapRb::new(fft_size),
                smoothed: vec![0.0; fft_size / 2],
            })),
            feeder: Mutex::new(None),
        }
    }

    /// Erstellt einen Analyser, der fortlaufend aus `source` liest
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn attach(fft_size: usize, source: broadcast::Receiver<AudioFrame>) -> Self {
        let analyser = Self::new(fft_size);
        let state = Arc::clone(&analyser.state);
        let handle = tokio::spawn(Self::feed(state, source));
        *analyser.feeder.lock() = Some(handle);
        analyser
    }

    async fn feed(state: Arc<Mutex<AnalyserState>>, mut source: broadcast::Receiver<AudioFrame>) {
        loop {
            match source.recv().await {
                Ok(frame) => Self::write_into(&state, &frame),
                // Verpasste Frames sind für Pegelmessung irrelevant
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn write_into(state: &Mutex<AnalyserState>, samples: &[f32]) {
        let mut state = state.lock();
        for sample in samples {
            state.window.push_overwrite(*sample);
        }
    }

    /// Schreibt Samples direkt ins Analysefenster
    pub fn write(&self, samples: &[f32]) {
        Self::write_into(&self.state, samples);
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Frequenzenergie pro Bin, normiert auf 0..255
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let mut state = self.state.lock();

        // Die jüngsten fft_size Samples, vorne mit Stille aufgefüllt
        let available: Vec<f32> = state.window.iter().copied().collect();
        let padding = self.fft_size - available.len();
        let mut buffer: Vec<Complex<f32>> = std::iter::repeat(0.0)
            .take(padding)
            .chain(available)
            .enumerate()
            .map(|(i, s)| Complex::new(s * blackman(i, self.fft_size), 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let mut bytes = Vec::with_capacity(self.fft_size / 2);

        for (k, smoothed) in state.smoothed.iter_mut().enumerate() {
            let magnitude = buffer[k].norm() * scale;
            *smoothed =
                SMOOTHING_TIME_CONSTANT * *smoothed + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;

            let byte = if *smoothed > 0.0 {
                let db = 20.0 * smoothed.log10();
                (255.0 / range * (db - MIN_DECIBELS)).clamp(0.0, 255.0) as u8
            } else {
                0
            };
            bytes.push(byte);
        }

        bytes
    }

    /// Gemittelter Pegel in 0.0..=1.0
    pub fn level(&self) -> f32 {
        let bytes = self.byte_frequency_data();
        if bytes.is_empty() {
            return 0.0;
        }
        let sum: u32 = bytes.iter().map(|b| *b as u32).sum();
        (sum as f32 / bytes.len() as f32 / 255.0).clamp(0.0, 1.0)
    }

    /// Trennt den Analyser von seiner Quelle. Idempotent.
    pub fn disconnect(&self) {
        if let Some(handle) = self.feeder.lock().take() {
            handle.abort();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.feeder.lock().is_some()
    }
}

impl Drop for Analyser {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("fft_size", &self.fft_size)
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn blackman(i: usize, n: usize) -> f32 {
    let alpha = 0.16;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    let x = i as f32 / n as f32;
    a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
}

// ============================================================================
// METERING GRAPH
// ============================================================================

/// Zwei unabhängige Taps: lokales und entferntes Signal
#[derive(Debug)]
pub struct MeteringGraph {
    local: Analyser,
    remote: Analyser,
}

impl MeteringGraph {
    pub fn new(local: Analyser, remote: Analyser) -> Self {
        Self { local, remote }
    }

    /// Pegel (lokal, entfernt)
    pub fn levels(&self) -> (f32, f32) {
        (self.local.level(), self.remote.level())
    }

    pub fn disconnect(&self) {
        self.local.disconnect();
        self.remote.disconnect();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let analyser = Analyser::new(FFT_SIZE);
        analyser.write(&[0.0; 64]);
        assert_eq!(analyser.level(), 0.0);
        assert!(analyser.byte_frequency_data().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_bin_count_is_half_window() {
        let analyser = Analyser::new(FFT_SIZE);
        assert_eq!(analyser.frequency_bin_count(), 16);
        assert_eq!(analyser.byte_frequency_data().len(), 16);
    }

    #[test]
    fn test_loud_signal_raises_level() {
        let analyser = Analyser::new(FFT_SIZE);
        let tone = sine(3000.0, 16000.0, 256);

        let mut level = 0.0;
        // Glättung braucht ein paar Abfragen bis zum Einschwingen
        for chunk in tone.chunks(FFT_SIZE) {
            analyser.write(chunk);
            level = analyser.level();
        }

        assert!(level > 0.1, "level was {level}");
        assert!(level <= 1.0);
    }

    #[test]
    fn test_level_decays_after_signal_stops() {
        let analyser = Analyser::new(FFT_SIZE);
        for chunk in sine(2000.0, 16000.0, 256).chunks(FFT_SIZE) {
            analyser.write(chunk);
            analyser.level();
        }
        let loud = analyser.level();

        for _ in 0..40 {
            analyser.write(&[0.0; FFT_SIZE]);
            analyser.level();
        }
        assert!(analyser.level() < loud);
    }

    #[tokio::test]
    async fn test_attach_reads_from_source() {
        let (tx, rx) = broadcast::channel::<AudioFrame>(8);
        let analyser = Analyser::attach(FFT_SIZE, rx);

        let tone: AudioFrame = Arc::from(sine(4000.0, 16000.0, 64));
        tx.send(tone).unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let bytes = analyser.byte_frequency_data();
        assert!(bytes.iter().any(|b| *b > 0));

        analyser.disconnect();
        assert!(!analyser.is_attached());
    }
}
