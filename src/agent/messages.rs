//! Message Types für die Live-Session
//!
//! JSON über WebSocket. Der Client sendet einmal `setup` und danach
//! fortlaufend `realtimeInput`-Chunks; der Server antwortet mit
//! `setupComplete` und `serverContent`.

use super::transport::LiveConfig;
use serde::{Deserialize, Serialize};

// ============================================================================
// SHARED CONTENT TYPES
// ============================================================================

/// Inline-Daten (base64) mit MIME-Typ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
}

/// Eingehende Nachricht der Live-Session
///
/// Unbekannte Felder werden ignoriert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

impl LiveServerMessage {
    /// Nachricht mit einem Audio-Chunk (base64 PCM16)
    pub fn audio(data: impl Into<String>) -> Self {
        Self {
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    role: Some("model".to_string()),
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(Blob {
                            mime_type: "audio/pcm;rate=24000".to_string(),
                            data: data.into(),
                        }),
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Nachricht mit gesetztem Interruption-Flag
    pub fn interruption() -> Self {
        Self {
            server_content: Some(ServerContent {
                interrupted: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Audio-Payload: `serverContent.modelTurn.parts[0].inlineData.data`
    pub fn audio_data(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
            .map(|blob| blob.data.as_str())
    }

    /// `serverContent.interrupted`
    pub fn interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|content| content.interrupted)
            .unwrap_or(false)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Ein Chunk Echtzeit-Eingabe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

impl MediaBlob {
    /// PCM16 LE Mono, base64-kodiert
    pub fn pcm16(data: String, sample_rate: u32) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", sample_rate),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceSelection,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaBlob>,
}

/// Alle Client-Nachrichten (genau ein Feld gesetzt)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<Setup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    realtime_input: Option<RealtimeInput>,
}

impl LiveClientMessage {
    /// Setup aus der (nicht interpretierten) Agent-Konfiguration
    pub fn setup(config: &LiveConfig) -> Self {
        let speech_config = config.voice_name.as_ref().map(|voice| SpeechConfig {
            voice_config: VoiceSelection {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.clone(),
                },
            },
        });

        let system_instruction = config.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part {
                text: Some(text.clone()),
                inline_data: None,
            }],
        });

        Self {
            setup: Some(Setup {
                model: config.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec![config.response_modality.clone()],
                    speech_config,
                },
                system_instruction,
            }),
            realtime_input: None,
        }
    }

    pub fn realtime_input(blob: MediaBlob) -> Self {
        Self {
            setup: None,
            realtime_input: Some(RealtimeInput {
                media_chunks: vec![blob],
            }),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_path() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}]
                }
            }
        }"#;
        let msg: LiveServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.audio_data(), Some("AAA="));
        assert!(!msg.interrupted());
    }

    #[test]
    fn test_only_first_part_carries_audio() {
        let raw = r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"},{"inlineData":{"data":"AAA="}}]}}}"#;
        let msg: LiveServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.audio_data(), None);
    }

    #[test]
    fn test_interruption_flag() {
        let raw = r#"{"serverContent":{"interrupted":true}}"#;
        let msg: LiveServerMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.interrupted());
        assert_eq!(msg.audio_data(), None);
        assert_eq!(msg, LiveServerMessage::interruption());
    }

    #[test]
    fn test_setup_complete_and_unknown_fields() {
        let raw = r#"{"setupComplete":{},"usageMetadata":{"totalTokenCount":3}}"#;
        let msg: LiveServerMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.is_setup_complete());
    }

    #[test]
    fn test_setup_wire_format() {
        let config = LiveConfig {
            model: "models/test".to_string(),
            system_instruction: Some("be brief".to_string()),
            response_modality: "AUDIO".to_string(),
            voice_name: Some("Puck".to_string()),
        };
        let json = serde_json::to_value(LiveClientMessage::setup(&config)).unwrap();

        assert_eq!(json["setup"]["model"], "models/test");
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(json.get("realtimeInput").is_none());
    }

    #[test]
    fn test_realtime_input_wire_format() {
        let blob = MediaBlob::pcm16("AAA=".to_string(), 16000);
        let json = serde_json::to_value(LiveClientMessage::realtime_input(blob)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAA="}]}
            })
        );
    }
}
