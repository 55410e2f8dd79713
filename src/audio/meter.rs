//! Volume Monitor - Pegel im festen Takt abtasten
//!
//! Ein Tokio-Intervall fragt eine Sampler-Closure ab und reicht das
//! Ergebnis an den Callback weiter. Nach `stop()` startet garantiert kein
//! weiterer Callback mehr.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Standard-Takt der Pegelmessung
pub const METER_INTERVAL: Duration = Duration::from_millis(100);

/// Callback für (lokal/Eingang, entfernt/Ausgang)
pub type VolumeCallback = Arc<dyn Fn(f32, f32) + Send + Sync>;

/// Laufende Pegelmessung
pub struct VolumeMonitor {
    /// Wird während jedes Callbacks gehalten; reentrant, damit der Callback
    /// den Monitor selbst stoppen darf
    alive: Arc<ReentrantMutex<Cell<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VolumeMonitor {
    /// Startet die Messung
    ///
    /// `sampler` liefert `None`, solange kein Metering-Graph existiert;
    /// in diesem Takt wird dann nichts gemeldet.
    pub fn start<S>(interval: Duration, sampler: S, callback: VolumeCallback) -> Self
    where
        S: Fn() -> Option<(f32, f32)> + Send + Sync + 'static,
    {
        let alive = Arc::new(ReentrantMutex::new(Cell::new(true)));
        let alive_task = Arc::clone(&alive);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let guard = alive_task.lock();
                if !guard.get() {
                    break;
                }
                if let Some((local, remote)) = sampler() {
                    callback(local.clamp(0.0, 1.0), remote.clamp(0.0, 1.0));
                }
            }
        });

        Self {
            alive,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stoppt die Messung. Idempotent.
    pub fn stop(&self) {
        // Wartet auf einen gerade laufenden Callback (außer aus ihm selbst)
        self.alive.lock().set(false);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.alive.lock().get()
    }
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for VolumeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMonitor")
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (VolumeCallback, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = Arc::clone(&ticks);
        let callback: VolumeCallback = Arc::new(move |_, _| {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        });
        (callback, ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_100ms() {
        let (callback, ticks) = counting_callback();
        let monitor = VolumeMonitor::start(METER_INTERVAL, || Some((0.2, 0.4)), callback);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 10);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_stop() {
        let (callback, ticks) = counting_callback();
        let monitor = VolumeMonitor::start(METER_INTERVAL, || Some((0.0, 0.0)), callback);

        tokio::time::sleep(Duration::from_millis(350)).await;
        monitor.stop();
        monitor.stop();
        let seen = ticks.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_graph_reports_nothing() {
        let (callback, ticks) = counting_callback();
        let _monitor = VolumeMonitor::start(METER_INTERVAL, || None, callback);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_stop_its_monitor() {
        let slot: Arc<Mutex<Option<Arc<VolumeMonitor>>>> = Arc::new(Mutex::new(None));
        let ticks = Arc::new(AtomicUsize::new(0));
        let (slot_clone, ticks_clone) = (Arc::clone(&slot), Arc::clone(&ticks));

        let callback: VolumeCallback = Arc::new(move |_, _| {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(monitor) = slot_clone.lock().take() {
                monitor.stop();
            }
        });
        let monitor = Arc::new(VolumeMonitor::start(METER_INTERVAL, || Some((0.1, 0.1)), callback));
        *slot.lock() = Some(Arc::clone(&monitor));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_are_clamped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: VolumeCallback = Arc::new(move |a, b| seen_clone.lock().push((a, b)));
        let _monitor = VolumeMonitor::start(METER_INTERVAL, || Some((-1.0, 7.0)), callback);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(seen.lock().as_slice(), &[(0.0, 1.0)]);
    }
}
