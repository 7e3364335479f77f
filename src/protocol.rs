//! Messages of the Gemini Live `BidiGenerateContent` WebSocket protocol and
//! their translation into link-level inbound messages.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::{AudioFormat, AudioFrame};

// ======================== Link-level messages ========================

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// Turn lifecycle signals from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnSignal {
    /// The user started talking over the response.
    UserSpeaking,
    TurnComplete,
    Error(String),
}

/// One demultiplexed inbound item, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Audio(AudioFrame),
    Text { role: Role, text: String },
    Turn(TurnSignal),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed server message: {0}")]
    Json(#[from] serde_json::Error),
}

// ======================== Client -> server ========================

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

#[derive(Serialize, Debug, Default)]
pub struct Empty {}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug)]
pub struct TextPart {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Serialize, Debug)]
pub struct RealtimeInput {
    pub audio: OutboundBlob,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OutboundBlob {
    pub data: String,
    pub mime_type: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientContentMessage {
    pub client_content: ClientContent,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Parameters of the `setup` message.
#[derive(Debug, Clone)]
pub struct SetupParams<'a> {
    pub model: &'a str,
    pub voice_name: &'a str,
    pub response_modalities: &'a [String],
    pub system_instruction: &'a str,
    pub transcribe: bool,
}

pub fn setup_message(params: &SetupParams<'_>) -> SetupMessage {
    let model = if params.model.starts_with("models/") {
        params.model.to_string()
    } else {
        format!("models/{}", params.model)
    };

    SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: params.response_modalities.to_vec(),
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: params.voice_name.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                role: None,
                parts: vec![TextPart {
                    text: params.system_instruction.to_string(),
                }],
            },
            input_audio_transcription: params.transcribe.then(Empty::default),
            output_audio_transcription: params.transcribe.then(Empty::default),
        },
    }
}

pub fn audio_message(frame: &AudioFrame) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio: OutboundBlob {
                data: BASE64.encode(frame.as_bytes()),
                mime_type: frame.format().pcm_mime_type(),
            },
        },
    }
}

/// A complete user turn made of one text part.
pub fn user_text_message(text: &str) -> ClientContentMessage {
    ClientContentMessage {
        client_content: ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        },
    }
}

// ======================== Server -> client ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
    pub error: Option<ServerError>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub turn_complete: bool,
    pub interrupted: bool,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<InboundPart>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundPart {
    pub text: Option<String>,
    pub inline_data: Option<InboundBlob>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InboundBlob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Transcription {
    pub text: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GoAway {
    pub time_left: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ServerError {
    pub code: Option<i64>,
    pub message: String,
}

impl ServerMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into inbound messages in the order they should be handled.
    /// Audio without a rate in its mime type is assumed to be `fallback`.
    /// An audio part that does not decode is skipped, the rest of the
    /// message still comes through.
    pub fn into_inbound(self, fallback: AudioFormat) -> Vec<InboundMessage> {
        let mut out = Vec::new();

        if let Some(err) = self.error {
            let msg = match err.code {
                Some(code) => format!("{} ({})", err.message, code),
                None => err.message,
            };
            out.push(InboundMessage::Turn(TurnSignal::Error(msg)));
        }

        let Some(content) = self.server_content else {
            return out;
        };

        if content.interrupted {
            out.push(InboundMessage::Turn(TurnSignal::UserSpeaking));
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            out.push(InboundMessage::Text {
                role: Role::User,
                text: t.text,
            });
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(blob) = part.inline_data {
                match BASE64.decode(blob.data.as_bytes()) {
                    Ok(data) => {
                        let format = AudioFormat::new(
                            pcm_rate(&blob.mime_type).unwrap_or(fallback.sample_rate),
                            fallback.channels,
                        );
                        out.push(InboundMessage::Audio(AudioFrame::from_bytes(data, format)));
                    }
                    Err(e) => tracing::warn!("Skipping undecodable audio part: {}", e),
                }
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                out.push(InboundMessage::Text {
                    role: Role::Model,
                    text,
                });
            }
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            out.push(InboundMessage::Text {
                role: Role::Model,
                text: t.text,
            });
        }
        if content.turn_complete {
            out.push(InboundMessage::Turn(TurnSignal::TurnComplete));
        }

        out
    }
}

/// `audio/pcm;rate=24000` -> `Some(24000)`
fn pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}
