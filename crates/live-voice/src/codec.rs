//! Wire codec for the bidirectional streaming protocol
//!
//! Outbound messages are built as JSON envelopes (`setup`, `realtimeInput`).
//! Inbound frames are parsed into a typed view where every top-level key is
//! optional, so a single frame can yield several [`ControlMessage`]s.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::audio::AudioChunk;
use crate::config::ModelConfig;

/// Parameters of the setup handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupParams {
    pub model: String,
    pub response_modalities: Vec<String>,
    pub voice_name: Option<String>,
    pub temperature: Option<f32>,
    pub system_instruction: Option<String>,
    /// Handle from a previous connection, for resuming.
    pub resumption_handle: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl SetupParams {
    pub fn from_config(model: &ModelConfig, resumption_handle: Option<String>) -> Self {
        Self {
            model: model.model.clone(),
            response_modalities: model.response_modalities.clone(),
            voice_name: model.voice_name.clone(),
            temperature: model.temperature,
            system_instruction: model.system_instruction.clone(),
            resumption_handle,
            input_transcription: model.input_transcription,
            output_transcription: model.output_transcription,
        }
    }
}

/// Every message that crosses the wire, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    // outbound
    Setup(SetupParams),
    AudioData(AudioChunk),
    AudioStreamEnd,

    // inbound
    SetupComplete,
    /// Base64 PCM exactly as received.
    ServerAudio { mime_type: String, data: String },
    ServerText(String),
    InputTranscription(String),
    OutputTranscription(String),
    TurnComplete,
    Interrupted,
    SessionResumptionUpdate {
        handle: Option<String>,
        resumable: bool,
    },
    UsageMetadata(Value),
    GoAway { time_left: Option<String> },
    Error { code: Option<i64>, message: String },
}

impl ControlMessage {
    /// Serialize an outbound message to its JSON text frame.
    pub fn encode(&self) -> Result<String, EncodeError> {
        let value = match self {
            ControlMessage::Setup(params) => encode_setup(params),
            ControlMessage::AudioData(chunk) => json!({
                "realtimeInput": {
                    "mediaChunks": [{
                        "mimeType": chunk.format.mime_type(),
                        "data": STANDARD.encode(&chunk.bytes),
                    }]
                }
            }),
            ControlMessage::AudioStreamEnd => json!({
                "realtimeInput": { "audioStreamEnd": true }
            }),
            other => return Err(EncodeError::NotOutbound(other.name())),
        };
        Ok(value.to_string())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Setup(_) => "setup",
            ControlMessage::AudioData(_) => "audio_data",
            ControlMessage::AudioStreamEnd => "audio_stream_end",
            ControlMessage::SetupComplete => "setup_complete",
            ControlMessage::ServerAudio { .. } => "server_audio",
            ControlMessage::ServerText(_) => "server_text",
            ControlMessage::InputTranscription(_) => "input_transcription",
            ControlMessage::OutputTranscription(_) => "output_transcription",
            ControlMessage::TurnComplete => "turn_complete",
            ControlMessage::Interrupted => "interrupted",
            ControlMessage::SessionResumptionUpdate { .. } => "session_resumption_update",
            ControlMessage::UsageMetadata(_) => "usage_metadata",
            ControlMessage::GoAway { .. } => "go_away",
            ControlMessage::Error { .. } => "error",
        }
    }
}

fn encode_setup(params: &SetupParams) -> Value {
    let mut generation = Map::new();
    generation.insert(
        "responseModalities".into(),
        json!(params.response_modalities),
    );
    if let Some(temperature) = params.temperature {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(voice) = &params.voice_name {
        generation.insert(
            "speechConfig".into(),
            json!({ "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } } }),
        );
    }

    let mut resumption = Map::new();
    if let Some(handle) = &params.resumption_handle {
        resumption.insert("handle".into(), json!(handle));
    }

    let mut setup = Map::new();
    setup.insert("model".into(), json!(params.model));
    setup.insert("generationConfig".into(), Value::Object(generation));
    if let Some(instruction) = &params.system_instruction {
        setup.insert(
            "systemInstruction".into(),
            json!({ "parts": [{ "text": instruction }] }),
        );
    }
    // Always present so the service issues resumption handles.
    setup.insert("sessionResumption".into(), Value::Object(resumption));
    if params.input_transcription {
        setup.insert("inputAudioTranscription".into(), json!({}));
    }
    if params.output_transcription {
        setup.insert("outputAudioTranscription".into(), json!({}));
    }

    json!({ "setup": Value::Object(setup) })
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("binary frame is not UTF-8")]
    NotUtf8,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{0} is not an outbound message")]
    NotOutbound(&'static str),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    turn_complete: Option<bool>,
    interrupted: Option<bool>,
    session_resumption_update: Option<ResumptionUpdate>,
    usage_metadata: Option<Value>,
    go_away: Option<GoAwayBody>,
    error: Option<ServerError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    turn_complete: Option<bool>,
    interrupted: Option<bool>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumptionUpdate {
    #[serde(alias = "handle")]
    new_handle: Option<String>,
    resumable: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAwayBody {
    time_left: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerError {
    code: Option<i64>,
    message: Option<String>,
    status: Option<String>,
}

/// Decode one text frame. Every recognized key is processed.
pub fn decode_frame(text: &str) -> Result<Vec<ControlMessage>, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let frame = ServerFrame::deserialize(value)?;
    let mut out = Vec::new();

    if frame.setup_complete.is_some() {
        out.push(ControlMessage::SetupComplete);
    }

    let mut turn_complete = frame.turn_complete.unwrap_or(false);
    let mut interrupted = frame.interrupted.unwrap_or(false);

    if let Some(content) = frame.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text {
                    out.push(ControlMessage::ServerText(text));
                }
                if let Some(inline) = part.inline_data {
                    if inline.mime_type.starts_with("audio/") {
                        out.push(ControlMessage::ServerAudio {
                            mime_type: inline.mime_type,
                            data: inline.data,
                        });
                    }
                }
            }
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            out.push(ControlMessage::InputTranscription(text));
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            out.push(ControlMessage::OutputTranscription(text));
        }
        interrupted |= content.interrupted.unwrap_or(false);
        turn_complete |= content.turn_complete.unwrap_or(false);
    }

    if interrupted {
        out.push(ControlMessage::Interrupted);
    }
    if turn_complete {
        out.push(ControlMessage::TurnComplete);
    }

    if let Some(update) = frame.session_resumption_update {
        let resumable = update.resumable.unwrap_or(update.new_handle.is_some());
        out.push(ControlMessage::SessionResumptionUpdate {
            handle: update.new_handle.filter(|_| resumable),
            resumable,
        });
    }

    if let Some(usage) = frame.usage_metadata {
        out.push(ControlMessage::UsageMetadata(usage));
    }

    if let Some(go_away) = frame.go_away {
        out.push(ControlMessage::GoAway {
            time_left: go_away.time_left,
        });
    }

    if let Some(err) = frame.error {
        let message = err
            .message
            .or(err.status)
            .unwrap_or_else(|| "unknown server error".to_string());
        out.push(ControlMessage::Error {
            code: err.code,
            message,
        });
    }

    Ok(out)
}

/// Binary frames carry the same JSON as text frames.
pub fn decode_binary(bytes: &[u8]) -> Result<Vec<ControlMessage>, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    decode_frame(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_setup_envelope() {
        let params = SetupParams::from_config(&ModelConfig::default(), None);
        let value = parse(&ControlMessage::Setup(params).encode().unwrap());

        assert_eq!(value["setup"]["model"], "models/gemini-2.0-flash-exp");
        assert_eq!(
            value["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert_eq!(value["setup"]["sessionResumption"], json!({}));
        assert!(value["setup"].get("inputAudioTranscription").is_none());
    }

    #[test]
    fn test_setup_carries_resumption_handle() {
        let params = SetupParams::from_config(&ModelConfig::default(), Some("h-1".into()));
        let value = parse(&ControlMessage::Setup(params).encode().unwrap());
        assert_eq!(value["setup"]["sessionResumption"]["handle"], "h-1");
    }

    #[test]
    fn test_audio_and_stream_end() {
        let chunk = AudioChunk::outbound(vec![1, 0, 2, 0], AudioFormat::UPLINK);
        let value = parse(&ControlMessage::AudioData(chunk).encode().unwrap());
        let media = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], STANDARD.encode([1u8, 0, 2, 0]));

        let end = parse(&ControlMessage::AudioStreamEnd.encode().unwrap());
        assert_eq!(end, json!({ "realtimeInput": { "audioStreamEnd": true } }));
    }

    #[test]
    fn test_inbound_not_encodable() {
        assert!(matches!(
            ControlMessage::TurnComplete.encode(),
            Err(EncodeError::NotOutbound("turn_complete"))
        ));
    }

    #[test]
    fn test_decode_setup_complete() {
        assert_eq!(
            decode_frame(r#"{"setupComplete":{}}"#).unwrap(),
            vec![ControlMessage::SetupComplete]
        );
    }

    #[test]
    fn test_decode_processes_every_key() {
        let frame = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "hello"}
                ]},
                "turnComplete": true
            },
            "usageMetadata": {"totalTokenCount": 42},
            "somethingNew": 1
        }"#;
        let messages = decode_frame(frame).unwrap();
        assert_eq!(
            messages,
            vec![
                ControlMessage::ServerAudio {
                    mime_type: "audio/pcm;rate=24000".into(),
                    data: "AAA=".into()
                },
                ControlMessage::ServerText("hello".into()),
                ControlMessage::TurnComplete,
                ControlMessage::UsageMetadata(json!({"totalTokenCount": 42})),
            ]
        );
    }

    #[test]
    fn test_decode_interrupt_not_duplicated() {
        let messages =
            decode_frame(r#"{"interrupted":true,"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(messages, vec![ControlMessage::Interrupted]);
    }

    #[test]
    fn test_decode_resumption_update() {
        let messages =
            decode_frame(r#"{"sessionResumptionUpdate":{"newHandle":"abc","resumable":true}}"#)
                .unwrap();
        assert_eq!(
            messages,
            vec![ControlMessage::SessionResumptionUpdate {
                handle: Some("abc".into()),
                resumable: true
            }]
        );

        let messages =
            decode_frame(r#"{"sessionResumptionUpdate":{"handle":"abc","resumable":false}}"#)
                .unwrap();
        assert_eq!(
            messages,
            vec![ControlMessage::SessionResumptionUpdate {
                handle: None,
                resumable: false
            }]
        );
    }

    #[test]
    fn test_decode_error_and_go_away() {
        let messages = decode_frame(
            r#"{"goAway":{"timeLeft":"10s"},"error":{"code":401,"message":"API key not valid"}}"#,
        )
        .unwrap();
        assert_eq!(
            messages,
            vec![
                ControlMessage::GoAway {
                    time_left: Some("10s".into())
                },
                ControlMessage::Error {
                    code: Some(401),
                    message: "API key not valid".into()
                },
            ]
        );
    }

    #[test]
    fn test_decode_transcriptions() {
        let messages = decode_frame(
            r#"{"serverContent":{"inputTranscription":{"text":"hi"},"outputTranscription":{"text":"hello there"}}}"#,
        )
        .unwrap();
        assert_eq!(
            messages,
            vec![
                ControlMessage::InputTranscription("hi".into()),
                ControlMessage::OutputTranscription("hello there".into()),
            ]
        );
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(decode_frame("{not json").is_err());
        assert!(decode_frame("[1,2]").is_err());
        assert!(decode_binary(&[0xff, 0xfe]).is_err());
        assert!(decode_frame("{}").unwrap().is_empty());
    }
}
