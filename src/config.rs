//! Konfiguration
//!
//! `config.json` im Konfigurationsverzeichnis der Plattform, danach
//! Umgebungsvariablen. Fehlende Felder fallen auf die Defaults zurück.
//!
//! ## Verwendung
//! ```rust,no_run
//! let config = voicelink::config::VoiceConfig::load()?;
//! let options = config.agent.options();
//! # Ok::<(), voicelink::config::ConfigError>(())
//! ```

use crate::agent::{
    AgentOptions, LiveConfig, INPUT_FRAME_SIZE, INPUT_SAMPLE_RATE, OUTBOUND_QUEUE_CAPACITY,
    OUTPUT_SAMPLE_RATE,
};
use crate::call::default_ice_servers;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Dateiname im Konfigurationsverzeichnis
pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";
const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
const DEFAULT_VOICE: &str = "Puck";
const DEFAULT_MODALITY: &str = "AUDIO";
const DEFAULT_INSTRUCTION: &str =
    "You are a friendly voice assistant. Keep your answers short and conversational.";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// CONFIG TYPES
// ============================================================================

/// Gesamtkonfiguration beider Modi
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub meter_interval_ms: u64,
    pub agent: AgentSettings,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            meter_interval_ms: 100,
            agent: AgentSettings::default(),
        }
    }
}

/// Einstellungen des Sprachagenten
///
/// Modell, Stimme, Persona und Modalität werden nur durchgereicht.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub instruction: String,
    pub response_modality: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub queue_capacity: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            response_modality: DEFAULT_MODALITY.to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: INPUT_FRAME_SIZE,
            queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl std::fmt::Debug for AgentSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // API-Key nicht loggen
        f.debug_struct("AgentSettings")
            .field("api_key", &(!self.api_key.is_empty()))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("response_modality", &self.response_modality)
            .field("input_sample_rate", &self.input_sample_rate)
            .field("output_sample_rate", &self.output_sample_rate)
            .field("frame_size", &self.frame_size)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl AgentSettings {
    /// Setup-Konfiguration der Live-Session
    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            model: self.model.clone(),
            system_instruction: non_empty(&self.instruction),
            response_modality: self.response_modality.clone(),
            voice_name: non_empty(&self.voice),
        }
    }

    /// Optionen für den `AgentSessionManager`
    pub fn options(&self) -> AgentOptions {
        let mut options = AgentOptions::new(self.live_config());
        options.input_sample_rate = self.input_sample_rate;
        options.output_sample_rate = self.output_sample_rate;
        options.frame_size = self.frame_size;
        options.queue_capacity = self.queue_capacity;
        options
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// ============================================================================
// LOADING
// ============================================================================

impl VoiceConfig {
    /// Lädt `config.json` (falls vorhanden) und wendet Umgebungsvariablen an
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Liest eine Konfigurationsdatei ohne Umgebungsvariablen
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Überschreibt Felder aus der Prozess-Umgebung
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.agent.api_key = key;
        }
        if let Some(model) = lookup("VOICE_AGENT_MODEL") {
            self.agent.model = model;
        }
        if let Some(voice) = lookup("VOICE_AGENT_VOICE") {
            self.agent.voice = voice;
        }
        if let Some(instruction) = lookup("VOICE_AGENT_INSTRUCTION") {
            self.agent.instruction = instruction;
        }
    }

    /// Pfad zu `config.json` im Konfigurationsverzeichnis
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("com", "voicelink", "voicelink")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms.max(1))
    }
}

// ============================================================================
// TESTS
// ============================================================================
