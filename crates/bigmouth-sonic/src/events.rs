//! Typed wire events for the bidirectional session protocol.
//!
//! Every event travels as one JSON object wrapped in an `{"event": ...}`
//! envelope. The outbound side is an externally tagged enum so the variant
//! name becomes the event name on the wire; the inbound side is a struct of
//! optional payloads, which makes unrecognized event types a structural
//! no-op rather than a parse error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{SonicError, SonicResult};

/// Speaker role attached to a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Payload kind of a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentKind {
    Text,
    Audio,
}

/// Inference parameters sent with `sessionStart`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
    pub max_tokens: u32,
    pub top_p: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOutputConfiguration {
    pub media_type: String,
}

impl TextOutputConfiguration {
    pub fn plain() -> Self {
        Self {
            media_type: "text/plain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutputConfiguration {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u32,
    pub channel_count: u32,
    pub voice_id: String,
    pub encoding: String,
    pub audio_type: String,
}

impl AudioOutputConfiguration {
    /// 16-bit mono linear PCM speech output at the given rate.
    pub fn lpcm(sample_rate_hertz: u32, voice_id: &str) -> Self {
        Self {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz,
            sample_size_bits: 16,
            channel_count: 1,
            voice_id: voice_id.to_string(),
            encoding: "base64".to_string(),
            audio_type: "SPEECH".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextInputConfiguration {
    pub media_type: String,
}

impl TextInputConfiguration {
    pub fn plain() -> Self {
        Self {
            media_type: "text/plain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInputConfiguration {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u32,
    pub channel_count: u32,
    pub audio_type: String,
    pub encoding: String,
}

impl AudioInputConfiguration {
    /// 16-bit mono linear PCM speech input at the given rate.
    pub fn lpcm(sample_rate_hertz: u32) -> Self {
        Self {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz,
            sample_size_bits: 16,
            channel_count: 1,
            audio_type: "SPEECH".to_string(),
            encoding: "base64".to_string(),
        }
    }
}

/// Events the engine sends to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    SessionStart {
        inference_configuration: InferenceConfiguration,
    },
    #[serde(rename_all = "camelCase")]
    PromptStart {
        prompt_name: String,
        text_output_configuration: TextOutputConfiguration,
        audio_output_configuration: AudioOutputConfiguration,
    },
    #[serde(rename_all = "camelCase")]
    ContentStart {
        prompt_name: String,
        content_name: String,
        #[serde(rename = "type")]
        kind: ContentKind,
        interactive: bool,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        text_input_configuration: Option<TextInputConfiguration>,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_input_configuration: Option<AudioInputConfiguration>,
    },
    #[serde(rename_all = "camelCase")]
    TextInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    AudioInput {
        prompt_name: String,
        content_name: String,
        /// Base64-encoded 16-bit PCM.
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ContentEnd {
        prompt_name: String,
        content_name: String,
    },
    #[serde(rename_all = "camelCase")]
    PromptEnd { prompt_name: String },
    SessionEnd {},
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    event: &'a OutboundEvent,
}

/// Serialize an event into its on-wire `{"event": {...}}` form.
pub fn encode(event: &OutboundEvent) -> SonicResult<Vec<u8>> {
    Ok(serde_json::to_vec(&OutboundEnvelope { event })?)
}

/// Base64-encode a raw PCM frame for an `audioInput` event.
pub fn encode_audio_payload(pcm: &[u8]) -> String {
    BASE64.encode(pcm)
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct InboundEnvelope {
    #[serde(default)]
    pub event: Option<InboundBody>,
}

/// Known inbound payloads. Anything else in the envelope is ignored for
/// forward compatibility.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct InboundBody {
    pub content_start: Option<InboundContentStart>,
    pub text_output: Option<TextOutput>,
    pub audio_output: Option<AudioOutput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundContentStart {
    pub role: Role,
    /// JSON-encoded string of extra model fields; `generationStage` marks
    /// draft content that has not been finalized yet.
    #[serde(default)]
    pub additional_model_fields: Option<String>,
}

impl InboundContentStart {
    /// True when the block carries speculative (draft) content.
    pub fn is_speculative(&self) -> bool {
        let Some(raw) = self.additional_model_fields.as_deref() else {
            return false;
        };
        serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .and_then(|v| v.get("generationStage").and_then(|s| s.as_str().map(String::from)))
            .is_some_and(|stage| stage == "SPECULATIVE")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextOutput {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioOutput {
    /// Base64-encoded 16-bit PCM.
    pub content: String,
}

impl AudioOutput {
    pub fn decode(&self) -> SonicResult<Vec<u8>> {
        BASE64
            .decode(&self.content)
            .map_err(|e| SonicError::Protocol(format!("invalid audio payload: {e}")))
    }
}
