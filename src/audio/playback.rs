//! Playback Schedule - lückenlose Wiedergabe eingehender Audio-Chunks
//!
//! Jeder Chunk startet frühestens am Cursor bzw. an der aktuellen
//! Kontext-Uhr (das spätere von beiden); danach rückt der Cursor um die
//! Chunk-Dauer vor. Eine Unterbrechung stoppt alle geplanten Quellen und
//! setzt den Cursor auf 0 zurück.

use super::context::{AudioBuffer, AudioContext, SourceId};

#[derive(Debug, Clone, Copy)]
struct Scheduled {
    id: SourceId,
    end: f64,
}

/// Cursor `next_start_time` plus die noch laufenden Quellen
#[derive(Debug, Default)]
pub struct PlaybackSchedule {
    next_start_time: f64,
    scheduled: Vec<Scheduled>,
}

impl PlaybackSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant einen Chunk ein und gibt seine Startzeit zurück
    pub fn enqueue(&mut self, ctx: &dyn AudioContext, buffer: AudioBuffer) -> f64 {
        let now = ctx.current_time();
        let start = self.next_start_time.max(now);
        let duration = buffer.duration();

        let id = ctx.start_source(buffer, start);
        self.next_start_time = start + duration;

        // Ausgespielte Quellen vergessen
        self.scheduled.retain(|s| s.end > now);
        self.scheduled.push(Scheduled {
            id,
            end: start + duration,
        });

        start
    }

    /// Stoppt alles Geplante/Laufende und setzt den Cursor zurück
    ///
    /// Gibt die Anzahl gestoppter Quellen zurück.
    pub fn interrupt(&mut self, ctx: &dyn AudioContext) -> usize {
        let stopped = self.scheduled.len();
        for source in self.scheduled.drain(..) {
            ctx.stop_source(source.id);
        }
        self.next_start_time = 0.0;
        stopped
    }

    /// Vergisst alles, ohne einen Kontext anzufassen (Kontext bereits zu)
    pub fn reset(&mut self) {
        self.scheduled.clear();
        self.next_start_time = 0.0;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
