//! Input Streaming - Mikrofon → Live-Session
//!
//! Frames vom Mikrofon werden auf die Rate des Eingabe-Kontexts gebracht,
//! in feste Blöcke zerlegt, als PCM16/base64 kodiert und über eine
//! beschränkte Queue an einen Sender-Task übergeben. Ist die Queue voll,
//! wird der Block verworfen: die Aufnahme wartet nie auf das Netz.

use super::messages::MediaBlob;
use super::transport::LiveSession;
use crate::audio::codec::{encode_base64, f32_to_pcm16, resample_linear};
use crate::media::AudioFrame;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Blockgröße der Eingabe (Samples, mono)
pub const INPUT_FRAME_SIZE: usize = 4096;

/// Kapazität der ausgehenden Queue (Blöcke)
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

// ============================================================================
// FRAME BUFFER
// ============================================================================

/// Sammelt Samples und gibt volle Blöcke fester Größe heraus
#[derive(Debug)]
pub(crate) struct FrameBuffer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameBuffer {
    pub(crate) fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Nimmt Samples auf und liefert alle dadurch vollständigen Blöcke
    pub(crate) fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// INPUT STREAMER
// ============================================================================

/// Parameter des Input Streamings
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamerConfig {
    pub source_rate: u32,
    pub target_rate: u32,
    pub frame_size: usize,
    pub queue_capacity: usize,
}

/// Laufendes Input Streaming (Framer + Sender)
pub(crate) struct InputStreamer {
    framer: JoinHandle<()>,
    sender: JoinHandle<()>,
}

impl InputStreamer {
    pub(crate) fn start(
        frames: broadcast::Receiver<AudioFrame>,
        config: StreamerConfig,
        session: Arc<dyn LiveSession>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<MediaBlob>(config.queue_capacity.max(1));

        tracing::info!(
            "Input streaming started: {} Hz -> {} Hz, {} samples per frame",
            config.source_rate,
            config.target_rate,
            config.frame_size
        );

        Self {
            framer: tokio::spawn(run_framer(frames, config, tx)),
            sender: tokio::spawn(run_sender(rx, session)),
        }
    }

    /// Stoppt beide Tasks; noch nicht gesendete Blöcke werden verworfen
    pub(crate) fn stop(&self) {
        self.framer.abort();
        self.sender.abort();
    }
}

impl Drop for InputStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Kodiert einen Block für die Live-Session
pub(crate) fn encode_frame(frame: &[f32], sample_rate: u32) -> MediaBlob {
    MediaBlob::pcm16(encode_base64(&f32_to_pcm16(frame)), sample_rate)
}

async fn run_framer(
    mut frames: broadcast::Receiver<AudioFrame>,
    config: StreamerConfig,
    tx: mpsc::Sender<MediaBlob>,
) {
    let mut buffer = FrameBuffer::new(config.frame_size);
    let mut dropped: u64 = 0;

    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Input streaming lagged, {} capture frames skipped", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let resampled = resample_linear(&frame, config.source_rate, config.target_rate);
        for block in buffer.push(&resampled) {
            match tx.try_send(encode_frame(&block, config.target_rate)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped == 1 || dropped % 50 == 0 {
                        tracing::warn!("Outbound queue full, {} input frames dropped", dropped);
                    }
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

async fn run_sender(mut rx: mpsc::Receiver<MediaBlob>, session: Arc<dyn LiveSession>) {
    while let Some(blob) = rx.recv().await {
        if let Err(e) = session.send_realtime_input(blob).await {
            tracing::debug!("Input frame not delivered: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
