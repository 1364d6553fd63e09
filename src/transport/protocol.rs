//! JSON wire protocol of the live voice service.
//!
//! Outbound: one `setup` message, then a stream of `realtimeInput` media
//! chunks. Inbound: `setupComplete`, then `serverContent` messages carrying
//! inline audio parts and turn flags.

use crate::audio::codec::pcm16_to_base64;
use crate::config::ServiceConfig;
use crate::pipeline::messages::{AudioFrame, ControlEvent};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client -> service
// ---------------------------------------------------------------------------

/// Messages sent to the service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64 of little-endian PCM16.
    pub data: String,
}

impl ClientMessage {
    /// The session setup message for `config`.
    pub fn setup(config: &ServiceConfig) -> Self {
        let system_instruction = if config.system_instruction.trim().is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![TextPart {
                    text: config.system_instruction.clone(),
                }],
            })
        };
        Self::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality.clone()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    /// Wrap one captured frame as a realtime media chunk.
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: format!("audio/pcm;rate={}", frame.sample_rate),
                data: pcm16_to_base64(&frame.samples),
            }],
        })
    }
}

// ---------------------------------------------------------------------------
// Service -> client
// ---------------------------------------------------------------------------

/// Any message from the service. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub error: Option<ServiceError>,
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceError {
    pub code: Option<i64>,
    pub message: String,
}

/// One demultiplexed unit of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SetupComplete,
    /// Base64 PCM16 audio, still encoded.
    Audio(Bytes),
    Control(ControlEvent),
    /// The service announced it will disconnect soon.
    GoAway,
}

impl ServerMessage {
    /// Split into events: audio parts first in order, then `Interrupted`,
    /// then `TurnComplete`.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }
        if let Some(content) = self.server_content {
            let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
            for part in parts {
                if let Some(inline) = part.inline_data
                    && is_audio(inline.mime_type.as_deref())
                    && !inline.data.is_empty()
                {
                    events.push(ServerEvent::Audio(Bytes::from(inline.data)));
                }
            }
            if content.interrupted {
                events.push(ServerEvent::Control(ControlEvent::Interrupted));
            }
            if content.turn_complete {
                events.push(ServerEvent::Control(ControlEvent::TurnComplete));
            }
        }
        if let Some(err) = self.error {
            let message = match err.code {
                Some(code) => format!("{} (code {code})", err.message),
                None => err.message,
            };
            events.push(ServerEvent::Control(ControlEvent::Error(message)));
        }
        if self.go_away.is_some() {
            events.push(ServerEvent::GoAway);
        }
        events
    }
}

fn is_audio(mime: Option<&str>) -> bool {
    mime.is_none_or(|m| m.starts_with("audio/"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::time::Instant;

    #[test]
    fn setup_message_shape() {
        let config = ServiceConfig::default();
        let json = serde_json::to_value(ClientMessage::setup(&config)).unwrap();

        let setup = &json["setup"];
        assert_eq!(setup["model"], config.model.as_str());
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert!(
            setup["systemInstruction"]["parts"][0]["text"]
                .as_str()
                .unwrap()
                .contains("Marta")
        );
    }

    #[test]
    fn empty_system_instruction_is_omitted() {
        let config = ServiceConfig {
            system_instruction: "  ".into(),
            ..ServiceConfig::default()
        };
        let json = serde_json::to_value(ClientMessage::setup(&config)).unwrap();
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn audio_frame_becomes_media_chunk() {
        let frame = AudioFrame {
            seq: 3,
            samples: vec![1, -1],
            sample_rate: 16_000,
            captured_at: Instant::now(),
        };
        let json = serde_json::to_value(ClientMessage::audio(&frame)).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AQD//w==");
    }

    #[test]
    fn demux_orders_audio_before_flags() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "thinking"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQA="}}
                ]},
                "interrupted": true,
                "turnComplete": true
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![
                ServerEvent::Audio(Bytes::from_static(b"AAA=")),
                ServerEvent::Audio(Bytes::from_static(b"AQA=")),
                ServerEvent::Control(ControlEvent::Interrupted),
                ServerEvent::Control(ControlEvent::TurnComplete),
            ]
        );
    }

    #[test]
    fn setup_complete_and_error_are_recognised() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(msg.into_events(), vec![ServerEvent::SetupComplete]);

        let msg: ServerMessage =
            serde_json::from_str(r#"{"error": {"code": 429, "message": "quota"}}"#).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![ServerEvent::Control(ControlEvent::Error(
                "quota (code 429)".into()
            ))]
        );
    }

    #[test]
    fn non_audio_inline_data_is_ignored() {
        let raw = r#"{"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "image/png", "data": "iVBO"}}
        ]}}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn unknown_messages_produce_no_events() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"usageMetadata": {"totalTokenCount": 12}}"#).unwrap();
        assert!(msg.into_events().is_empty());
    }
}
