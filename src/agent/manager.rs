//! Agent Session Manager
//!
//! Hält die bidirektionale Audioverbindung zum Sprachagenten: Mikrofon
//! hinaus, Agenten-Audio über den Playback Schedule hinein, Pegelmessung
//! beider Seiten. Eingabe und Ausgabe laufen auf zwei getrennten Kontexten
//! mit eigener Uhr und eigener Rate.

use super::input::{InputStreamer, StreamerConfig, INPUT_FRAME_SIZE, OUTBOUND_QUEUE_CAPACITY};
use super::messages::LiveServerMessage;
use super::transport::{AgentError, AgentTransport, LiveConfig, LiveEvent, LiveSession};
use crate::audio::codec::{decode_base64, pcm16_to_f32};
use crate::audio::{
    Analyser, AudioBuffer, AudioContext, AudioHost, ContextKind, PlaybackSchedule, VolumeMonitor,
    FFT_SIZE, METER_INTERVAL,
};
use crate::media::{MediaDevices, MediaStream};
use crate::session::SessionState;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Rate des Eingabe-Kontexts (Hz)
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Rate des Ausgabe-Kontexts (Hz)
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Fehlertext, wenn die Gegenseite keine Meldung mitliefert
pub const UNKNOWN_ERROR: &str = "Unknown error";

// ============================================================================
// OPTIONS & CALLBACKS
// ============================================================================

/// Feste Parameter einer Agent-Session
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub live: LiveConfig,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub queue_capacity: usize,
    pub meter_interval: Duration,
}

impl AgentOptions {
    pub fn new(live: LiveConfig) -> Self {
        Self {
            live,
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: INPUT_FRAME_SIZE,
            queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            meter_interval: METER_INTERVAL,
        }
    }
}

type NotifyCallback = Arc<dyn Fn() + Send + Sync>;
type LevelCallback = Arc<dyn Fn(f32, f32) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks der Agent-Session
#[derive(Clone, Default)]
pub struct AgentCallbacks {
    on_connect: Option<NotifyCallback>,
    on_disconnect: Option<NotifyCallback>,
    on_volume_change: Option<LevelCallback>,
    on_error: Option<MessageCallback>,
}

impl AgentCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session offen, Audio fließt
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Von der Gegenseite geschlossen
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Pegel (Eingang, Ausgang) im Messtakt
    pub fn on_volume_change(mut self, f: impl Fn(f32, f32) + Send + Sync + 'static) -> Self {
        self.on_volume_change = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for AgentCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_volume_change", &self.on_volume_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ============================================================================
// SESSION RECORD
// ============================================================================

#[derive(Default)]
struct AgentSession {
    state: SessionState,
    /// Wird bei jedem Abbau erhöht; ein laufendes `connect` erkennt so den Abbruch
    epoch: u64,
    callbacks: AgentCallbacks,
    input_ctx: Option<Arc<dyn AudioContext>>,
    output_ctx: Option<Arc<dyn AudioContext>>,
    mic: Option<MediaStream>,
    input_analyser: Option<Arc<Analyser>>,
    output_analyser: Option<Arc<Analyser>>,
    live: Option<Arc<dyn LiveSession>>,
    streamer: Option<InputStreamer>,
    monitor: Option<VolumeMonitor>,
    dispatcher: Option<JoinHandle<()>>,
    schedule: PlaybackSchedule,
    muted: bool,
}

impl AgentSession {
    fn take_resources(&mut self) -> AgentResources {
        self.epoch += 1;
        self.schedule.reset();
        AgentResources {
            monitor: self.monitor.take(),
            streamer: self.streamer.take(),
            mic: self.mic.take(),
            input_analyser: self.input_analyser.take(),
            output_analyser: self.output_analyser.take(),
            input_ctx: self.input_ctx.take(),
            output_ctx: self.output_ctx.take(),
            live: self.live.take(),
            dispatcher: self.dispatcher.take(),
        }
    }
}

/// Aus dem Record herausgenommene Ressourcen, freigegeben ohne Lock
struct AgentResources {
    monitor: Option<VolumeMonitor>,
    streamer: Option<InputStreamer>,
    mic: Option<MediaStream>,
    input_analyser: Option<Arc<Analyser>>,
    output_analyser: Option<Arc<Analyser>>,
    input_ctx: Option<Arc<dyn AudioContext>>,
    output_ctx: Option<Arc<dyn AudioContext>>,
    live: Option<Arc<dyn LiveSession>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl AgentResources {
    /// Jeder Schritt prüft selbst, ob die Ressource existiert
    fn release(self) {
        if let Some(monitor) = self.monitor {
            monitor.stop();
        }
        if let Some(streamer) = self.streamer {
            streamer.stop();
        }
        if let Some(mic) = self.mic {
            mic.stop_tracks();
        }
        if let Some(analyser) = self.input_analyser {
            analyser.disconnect();
        }
        if let Some(analyser) = self.output_analyser {
            analyser.disconnect();
        }
        if let Some(ctx) = self.input_ctx {
            ctx.close();
        }
        if let Some(ctx) = self.output_ctx {
            ctx.close();
        }
        if let Some(live) = self.live {
            live.close();
        }
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.abort();
        }
    }
}

// ============================================================================
// AGENT SESSION MANAGER
// ============================================================================

/// Lebenszyklus der Verbindung zum Sprachagenten
pub struct AgentSessionManager {
    transport: Arc<dyn AgentTransport>,
    devices: Arc<dyn MediaDevices>,
    host: Arc<dyn AudioHost>,
    options: AgentOptions,
    session: Arc<Mutex<AgentSession>>,
}

impl AgentSessionManager {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        devices: Arc<dyn MediaDevices>,
        host: Arc<dyn AudioHost>,
        options: AgentOptions,
    ) -> Self {
        Self {
            transport,
            devices,
            host,
            options,
            session: Arc::new(Mutex::new(AgentSession::default())),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Baut die Session auf
    ///
    /// No-op, solange bereits eine Session aufgebaut wird oder aktiv ist.
    /// Schlägt ein Schritt fehl, wird alles bis dahin Erworbene freigegeben.
    pub async fn connect(&self, callbacks: AgentCallbacks) -> Result<(), AgentError> {
        let epoch = {
            let mut session = self.session.lock();
            if session.state.is_busy() {
                tracing::debug!("Agent session already {}, ignoring connect", session.state);
                return Ok(());
            }
            session.state = SessionState::Connecting;
            session.callbacks = callbacks;
            session.epoch
        };

        match self.open(epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Agent connect failed: {}", e);
                let resources = {
                    let mut session = self.session.lock();
                    if session.epoch != epoch {
                        // Schon durch disconnect abgebaut
                        return Err(e);
                    }
                    session.state = SessionState::Idle;
                    session.take_resources()
                };
                resources.release();
                Err(e)
            }
        }
    }

    async fn open(&self, epoch: u64) -> Result<(), AgentError> {
        // Zwei unabhängige Kontexte: Eingabe (nur Uhr) und Ausgabe (mit Gerät)
        let input_ctx = self
            .host
            .create_context(self.options.input_sample_rate, ContextKind::Capture)?;
        self.store(epoch, |s| s.input_ctx = Some(Arc::clone(&input_ctx)))?;

        let output_ctx = self
            .host
            .create_context(self.options.output_sample_rate, ContextKind::Playback)?;
        let output_analyser = Arc::new(Analyser::attach(FFT_SIZE, output_ctx.output_tap()));
        self.store(epoch, |s| {
            s.output_ctx = Some(Arc::clone(&output_ctx));
            s.output_analyser = Some(output_analyser);
        })?;

        let mic = self.devices.get_user_media().await?;
        let input_analyser = Arc::new(Analyser::attach(FFT_SIZE, mic.subscribe()));
        if let Err(e) = self.store(epoch, |s| {
            mic.track().set_enabled(!s.muted);
            s.mic = Some(mic.clone());
            s.input_analyser = Some(Arc::clone(&input_analyser));
        }) {
            mic.stop_tracks();
            input_analyser.disconnect();
            return Err(e);
        }
        tracing::info!("Microphone acquired ({} Hz)", mic.sample_rate());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let live = self
            .transport
            .connect(self.options.live.clone(), events_tx)
            .await?;

        // Session zuerst ablegen: der Dispatcher braucht sie schon beim ersten `Open`
        if let Err(e) = self.store(epoch, |s| s.live = Some(Arc::clone(&live))) {
            live.close();
            return Err(e);
        }

        let mut session = self.session.lock();
        if session.epoch != epoch {
            drop(session);
            live.close();
            return Err(AgentError::Cancelled);
        }
        session.dispatcher = Some(tokio::spawn(run_dispatcher(
            Arc::downgrade(&self.session),
            events_rx,
            epoch,
            self.options.clone(),
        )));
        tracing::info!("Live session opened ({})", self.options.live.model);
        Ok(())
    }

    /// Legt eine Ressource im Record ab, sofern die Session noch dieselbe ist
    fn store<F>(&self, epoch: u64, f: F) -> Result<(), AgentError>
    where
        F: FnOnce(&mut AgentSession),
    {
        let mut session = self.session.lock();
        if session.epoch != epoch {
            return Err(AgentError::Cancelled);
        }
        f(&mut *session);
        Ok(())
    }

    /// Verarbeitet eine Server-Nachricht (Audio-Chunk und/oder Interruption)
    pub fn handle_server_message(&self, message: &LiveServerMessage) {
        apply_server_message(&self.session, self.options.output_sample_rate, message);
    }

    /// Vollständiger Abbau. Idempotent.
    pub fn disconnect(&self) {
        let resources = {
            let mut session = self.session.lock();
            if session.state != SessionState::Idle {
                tracing::info!("Disconnecting agent session ({})", session.state);
            }
            session.state = SessionState::Idle;
            session.take_resources()
        };
        resources.release();
    }

    /// Mute über den Track des Mikrofons
    pub fn set_muted(&self, muted: bool) {
        let mut session = self.session.lock();
        session.muted = muted;
        if let Some(mic) = &session.mic {
            mic.track().set_enabled(!muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.session.lock().muted
    }

    /// Startzeit des nächsten eingehenden Chunks auf der Ausgabe-Uhr
    pub fn next_start_time(&self) -> f64 {
        self.session.lock().schedule.next_start_time()
    }
}

impl Drop for AgentSessionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for AgentSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.session.lock();
        f.debug_struct("AgentSessionManager")
            .field("state", &session.state)
            .field("muted", &session.muted)
            .field("pending_chunks", &session.schedule.pending())
            .finish()
    }
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

async fn run_dispatcher(
    session: Weak<Mutex<AgentSession>>,
    mut events: mpsc::UnboundedReceiver<LiveEvent>,
    epoch: u64,
    options: AgentOptions,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.lock().epoch != epoch {
            break;
        }

        match event {
            LiveEvent::Open => handle_open(&session, &options),

            LiveEvent::Message(message) => {
                apply_server_message(&session, options.output_sample_rate, &message);
            }

            LiveEvent::Close { reason } => {
                tracing::info!("Live session closed by remote: {:?}", reason);
                let (resources, callback) = {
                    let mut session = session.lock();
                    session.state = SessionState::Closed;
                    let callback = session.callbacks.on_disconnect.clone();
                    (session.take_resources(), callback)
                };
                resources.release();
                if let Some(cb) = callback {
                    cb();
                }
                break;
            }

            LiveEvent::Error { message } => {
                let text = message.unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                tracing::error!("Live session error: {}", text);
                let callback = session.lock().callbacks.on_error.clone();
                if let Some(cb) = callback {
                    cb(&text);
                }
            }
        }
    }
}

/// Session offen: Input Streaming und Pegelmessung starten
fn handle_open(session: &Arc<Mutex<AgentSession>>, options: &AgentOptions) {
    let callback = {
        let mut guard = session.lock();
        let session = &mut *guard;
        if session.state != SessionState::Connecting {
            return;
        }
        let (Some(mic), Some(live), Some(input_ctx)) = (
            session.mic.clone(),
            session.live.clone(),
            session.input_ctx.clone(),
        ) else {
            return;
        };

        session.streamer = Some(InputStreamer::start(
            mic.subscribe(),
            StreamerConfig {
                source_rate: mic.sample_rate(),
                target_rate: input_ctx.sample_rate(),
                frame_size: options.frame_size,
                queue_capacity: options.queue_capacity,
            },
            live,
        ));

        if let (Some(input), Some(output)) =
            (session.input_analyser.clone(), session.output_analyser.clone())
        {
            let on_volume = session.callbacks.on_volume_change.clone();
            session.monitor = Some(VolumeMonitor::start(
                options.meter_interval,
                move || Some((input.level(), output.level())),
                Arc::new(move |input_level, output_level| {
                    if let Some(cb) = &on_volume {
                        cb(input_level, output_level);
                    }
                }),
            ));
        }

        session.state = SessionState::Active;
        session.callbacks.on_connect.clone()
    };

    tracing::info!("Agent session active");
    if let Some(cb) = callback {
        cb();
    }
}

/// Audio-Chunk einplanen, dann Interruption prüfen
fn apply_server_message(
    session: &Mutex<AgentSession>,
    output_rate: u32,
    message: &LiveServerMessage,
) {
    let mut guard = session.lock();
    let session = &mut *guard;
    let Some(ctx) = session.output_ctx.clone() else {
        tracing::debug!("Server message without output context dropped");
        return;
    };

    if let Some(data) = message.audio_data() {
        match decode_base64(data) {
            Ok(bytes) => {
                let samples = pcm16_to_f32(&bytes);
                if !samples.is_empty() {
                    let start = session
                        .schedule
                        .enqueue(ctx.as_ref(), AudioBuffer::new(samples, output_rate));
                    tracing::trace!("Chunk scheduled at {:.3}s", start);
                }
            }
            Err(e) => tracing::warn!("Invalid audio payload: {}", e),
        }
    }

    if message.interrupted() {
        let stopped = session.schedule.interrupt(ctx.as_ref());
        tracing::debug!("Interrupted, {} chunks flushed", stopped);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{encode_base64, f32_to_pcm16};
    use crate::audio::MixerContext;

    fn session_with_output(ctx: Arc<MixerContext>) -> Mutex<AgentSession> {
        let session = AgentSession {
            output_ctx: Some(ctx as Arc<dyn AudioContext>),
            ..Default::default()
        };
        Mutex::new(session)
    }

    fn chunk(samples: usize) -> LiveServerMessage {
        LiveServerMessage::audio(encode_base64(&f32_to_pcm16(&vec![0.1; samples])))
    }

    #[test]
    fn test_chunks_play_back_to_back() {
        let ctx = Arc::new(MixerContext::new(OUTPUT_SAMPLE_RATE));
        let session = session_with_output(Arc::clone(&ctx));

        apply_server_message(&session, OUTPUT_SAMPLE_RATE, &chunk(12000));
        apply_server_message(&session, OUTPUT_SAMPLE_RATE, &chunk(2400));

        let cursor = session.lock().schedule.next_start_time();
        assert!((cursor - 0.6).abs() < 1e-9);
        assert_eq!(ctx.active_sources(), 2);
    }

    #[test]
    fn test_interruption_flushes_and_resets() {
        let ctx = Arc::new(MixerContext::new(OUTPUT_SAMPLE_RATE));
        let session = session_with_output(Arc::clone(&ctx));

        apply_server_message(&session, OUTPUT_SAMPLE_RATE, &chunk(2400));
        apply_server_message(&session, OUTPUT_SAMPLE_RATE, &LiveServerMessage::interruption());

        assert_eq!(ctx.active_sources(), 0);
        assert_eq!(session.lock().schedule.next_start_time(), 0.0);
    }

    #[test]
    fn test_message_without_context_is_ignored() {
        let session = Mutex::new(AgentSession::default());
        apply_server_message(&session, OUTPUT_SAMPLE_RATE, &chunk(100));
        assert_eq!(session.lock().schedule.pending(), 0);
    }

    #[test]
    fn test_invalid_payload_is_dropped() {
        let ctx = Arc::new(MixerContext::new(OUTPUT_SAMPLE_RATE));
        let session = session_with_output(Arc::clone(&ctx));
        apply_server_message(&session, OUTPUT_SAMPLE_RATE, &LiveServerMessage::audio("%%%"));
        assert_eq!(ctx.active_sources(), 0);
    }

    #[test]
    fn test_take_resources_bumps_epoch() {
        let mut session = AgentSession::default();
        let before = session.epoch;
        session.take_resources().release();
        session.take_resources().release();
        assert_eq!(session.epoch, before + 2);
    }
}
