//! Voicelink - Echtzeit-Sprachsessions
//!
//! Zwei sich ausschließende Modi:
//! - P2P-Anruf über WebRTC mit WebSocket-Signaling (`call`)
//! - Bidirektionales Streaming mit einem Sprachagenten (`agent`)
//!
//! Beide teilen Mikrofon-Zugriff (`media`), Audio-Graph und Pegelmessung
//! (`audio`) sowie die Session-Zustände (`session`).

pub mod agent;
pub mod audio;
pub mod call;
pub mod config;
pub mod events;
pub mod media;
pub mod session;

pub use agent::{AgentCallbacks, AgentError, AgentOptions, AgentSessionManager};
pub use call::{CallCallbacks, CallSessionManager, PeerCallbacks};
pub use config::{ConfigError, VoiceConfig};
pub use events::{EventEmitter, Subscription};
pub use session::{SessionError, SessionState};

use agent::GeminiLiveTransport;
use anyhow::Context;
use audio::CpalHost;
use call::WebRtcTransport;
use media::CpalDevices;
use parking_lot::Mutex;
use std::sync::Arc;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den globalen tracing Subscriber
///
/// Filter aus `RUST_LOG`, sonst `voicelink=debug,webrtc=warn`. Mehrfache
/// Aufrufe sind harmlos.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voicelink=debug,webrtc=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// MODE SWITCH
// ============================================================================

/// Aktiver Modus von `VoiceDemo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    None,
    Call,
    Agent,
}

/// Hält beide Manager und sorgt dafür, dass nur einer aktiv ist
pub struct VoiceDemo {
    calls: CallSessionManager,
    agent: AgentSessionManager,
    mode: Mutex<Mode>,
}

impl VoiceDemo {
    pub fn new(calls: CallSessionManager, agent: AgentSessionManager) -> Self {
        Self {
            calls,
            agent,
            mode: Mutex::new(Mode::None),
        }
    }

    /// Verdrahtet cpal, WebRTC und Gemini Live aus der Konfiguration
    pub fn from_config(config: &VoiceConfig) -> Self {
        let devices = Arc::new(CpalDevices::new());
        let host = Arc::new(CpalHost::new());

        let transport = Arc::new(
            WebRtcTransport::new(config.signaling_url.clone())
                .with_ice_servers(config.ice_servers.clone()),
        );
        let calls =
            CallSessionManager::with_meter_interval(transport, devices.clone(), config.meter_interval());

        let mut options = config.agent.options();
        options.meter_interval = config.meter_interval();
        let live = Arc::new(GeminiLiveTransport::new(config.agent.api_key.clone()));
        let agent = AgentSessionManager::new(live, devices, host, options);

        Self::new(calls, agent)
    }

    /// Lädt die Konfiguration und verdrahtet die konkreten Komponenten
    pub fn load() -> anyhow::Result<Self> {
        let config = VoiceConfig::load().context("Failed to load voice config")?;
        if config.agent.api_key.is_empty() {
            tracing::warn!("No GEMINI_API_KEY configured, agent mode will fail to connect");
        }
        Ok(Self::from_config(&config))
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    pub fn calls(&self) -> &CallSessionManager {
        &self.calls
    }

    pub fn agent(&self) -> &AgentSessionManager {
        &self.agent
    }

    /// Wechselt in den Anruf-Modus; eine Agent-Session wird vorher beendet
    pub fn enter_call_mode(&self, local_id: &str, callbacks: PeerCallbacks) {
        self.agent.disconnect();
        *self.mode.lock() = Mode::Call;
        tracing::info!("Entering call mode as '{}'", local_id);
        self.calls.initialize(local_id, callbacks);
    }

    /// Wechselt in den Agent-Modus; die P2P-Session wird vorher beendet
    pub async fn enter_agent_mode(&self, callbacks: AgentCallbacks) -> Result<(), AgentError> {
        self.calls.shutdown();
        *self.mode.lock() = Mode::Agent;
        tracing::info!("Entering agent mode");
        self.agent.connect(callbacks).await
    }

    /// Beendet den aktiven Modus
    pub fn leave(&self) {
        let mode = std::mem::take(&mut *self.mode.lock());
        match mode {
            Mode::Call => self.calls.shutdown(),
            Mode::Agent => self.agent.disconnect(),
            Mode::None => {}
        }
    }
}

impl std::fmt::Debug for VoiceDemo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceDemo")
            .field("mode", &self.mode())
            .field("calls", &self.calls)
            .field("agent", &self.agent)
            .finish()
    }
}
