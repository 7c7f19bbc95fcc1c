//! Control-plane wire messages (JSON over text frames)
//!
//! Outbound messages are built through [`OutboundMessage`]; inbound text is
//! parsed with [`InboundMessage::parse`], which maps unknown types and
//! malformed JSON to protocol errors the caller logs and drops. Both the
//! legacy `iot` family and the `mcp` family are accepted until the
//! server-side migration is confirmed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sona_core::{AbortReason, ListeningMode, ProtocolError};

/// Control protocol version sent in `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Negotiated audio parameters inside `hello`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 16_000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

/// Server `hello` acknowledgement.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloAck {
    pub transport: Option<String>,
    pub session_id: Option<String>,
    pub audio_params: Option<AudioParams>,
}

/// `listen` message states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// `tts` message states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
}

/// Parsed inbound control message.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Hello(HelloAck),
    Tts {
        state: TtsState,
        text: Option<String>,
    },
    Stt {
        text: String,
    },
    Listen {
        state: ListenState,
    },
    Abort {
        reason: Option<String>,
    },
    /// Server turn finished; return to listening
    TurnEnd,
    /// JSON-RPC 2.0 envelope for the tool dispatcher
    Mcp {
        payload: Value,
    },
    /// Legacy tool-dispatch family, still routed to the dispatcher
    Iot {
        payload: Value,
    },
    Goodbye {
        session_id: Option<String>,
    },
}

impl InboundMessage {
    /// Parse one text frame. Unknown types and malformed JSON are protocol
    /// errors; the session logs and drops them.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::UnknownMessage("<missing type>".to_string()))?;

        match kind {
            "hello" => {
                let ack: HelloAck = serde_json::from_value(value.clone())
                    .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
                Ok(InboundMessage::Hello(ack))
            }
            "tts" => {
                let state = match value.get("state").and_then(Value::as_str) {
                    Some("start") => TtsState::Start,
                    Some("stop") => TtsState::Stop,
                    Some("sentence_start") => TtsState::SentenceStart,
                    other => {
                        return Err(ProtocolError::UnknownMessage(format!(
                            "tts state {other:?}"
                        )))
                    }
                };
                let text = value
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(InboundMessage::Tts { state, text })
            }
            "stt" => {
                let text = value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(InboundMessage::Stt { text })
            }
            "listen" => {
                let state = match value.get("state").and_then(Value::as_str) {
                    Some("start") => ListenState::Start,
                    Some("stop") => ListenState::Stop,
                    Some("detect") => ListenState::Detect,
                    other => {
                        return Err(ProtocolError::UnknownMessage(format!(
                            "listen state {other:?}"
                        )))
                    }
                };
                Ok(InboundMessage::Listen { state })
            }
            "abort" => Ok(InboundMessage::Abort {
                reason: value
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            "turn_end" => Ok(InboundMessage::TurnEnd),
            "mcp" => Ok(InboundMessage::Mcp {
                payload: value.get("payload").cloned().unwrap_or(Value::Null),
            }),
            "iot" => Ok(InboundMessage::Iot {
                payload: value.clone(),
            }),
            "goodbye" => Ok(InboundMessage::Goodbye {
                session_id: value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            other => Err(ProtocolError::UnknownMessage(other.to_string())),
        }
    }
}

/// Builders for outbound control messages.
pub struct OutboundMessage;

impl OutboundMessage {
    /// Client `hello` advertising the audio plane and MCP support.
    pub fn hello(transport: &str, audio_params: &AudioParams) -> String {
        json!({
            "type": "hello",
            "version": PROTOCOL_VERSION,
            "features": { "mcp": true },
            "transport": transport,
            "audio_params": audio_params,
        })
        .to_string()
    }

    pub fn listen_start(session_id: &str, mode: ListeningMode) -> String {
        json!({
            "session_id": session_id,
            "type": "listen",
            "state": "start",
            "mode": mode.wire_name(),
        })
        .to_string()
    }

    pub fn listen_stop(session_id: &str) -> String {
        json!({
            "session_id": session_id,
            "type": "listen",
            "state": "stop",
        })
        .to_string()
    }

    /// Wake word detected locally; carries the keyword text.
    pub fn listen_detect(session_id: &str, keyword: &str) -> String {
        json!({
            "session_id": session_id,
            "type": "listen",
            "state": "detect",
            "text": keyword,
        })
        .to_string()
    }

    pub fn abort(session_id: &str, reason: AbortReason) -> String {
        let mut message = json!({
            "session_id": session_id,
            "type": "abort",
        });
        if reason != AbortReason::None {
            message["reason"] = Value::String(reason.wire_name().to_string());
        }
        message.to_string()
    }

    /// JSON-RPC 2.0 result or error back to the server.
    pub fn mcp(session_id: &str, payload: Value) -> String {
        json!({
            "session_id": session_id,
            "type": "mcp",
            "payload": payload,
        })
        .to_string()
    }

    /// Legacy IoT state report.
    pub fn iot_states(session_id: &str, states: Value) -> String {
        json!({
            "session_id": session_id,
            "type": "iot",
            "update": true,
            "states": states,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_shape() {
        let hello = OutboundMessage::hello("websocket", &AudioParams::default());
        let value: Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["version"], 1);
        assert_eq!(value["features"]["mcp"], true);
        assert_eq!(value["audio_params"]["format"], "opus");
        assert_eq!(value["audio_params"]["sample_rate"], 16000);
        assert_eq!(value["audio_params"]["frame_duration"], 60);
    }

    #[test]
    fn test_listen_messages() {
        let start: Value =
            serde_json::from_str(&OutboundMessage::listen_start("s1", ListeningMode::AutoStop))
                .unwrap();
        assert_eq!(start["mode"], "auto");
        assert_eq!(start["state"], "start");

        let detect: Value =
            serde_json::from_str(&OutboundMessage::listen_detect("s1", "hey sona")).unwrap();
        assert_eq!(detect["state"], "detect");
        assert_eq!(detect["text"], "hey sona");
    }

    #[test]
    fn test_abort_reason_encoding() {
        let abort: Value =
            serde_json::from_str(&OutboundMessage::abort("s1", AbortReason::WakeWordDetected))
                .unwrap();
        assert_eq!(abort["reason"], "wake_word_detected");

        let silent: Value =
            serde_json::from_str(&OutboundMessage::abort("s1", AbortReason::None)).unwrap();
        assert!(silent.get("reason").is_none());
    }

    #[test]
    fn test_parse_hello_ack() {
        let text = r#"{"type":"hello","transport":"websocket","session_id":"abc",
            "audio_params":{"format":"opus","sample_rate":24000,"channels":1,"frame_duration":60}}"#;
        match InboundMessage::parse(text).unwrap() {
            InboundMessage::Hello(ack) => {
                assert_eq!(ack.session_id.as_deref(), Some("abc"));
                assert_eq!(ack.audio_params.unwrap().sample_rate, 24000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_tts_states() {
        let start = InboundMessage::parse(r#"{"type":"tts","state":"start"}"#).unwrap();
        assert!(matches!(
            start,
            InboundMessage::Tts {
                state: TtsState::Start,
                ..
            }
        ));

        let sentence =
            InboundMessage::parse(r#"{"type":"tts","state":"sentence_start","text":"hi"}"#)
                .unwrap();
        match sentence {
            InboundMessage::Tts { state, text } => {
                assert_eq!(state, TtsState::SentenceStart);
                assert_eq!(text.as_deref(), Some("hi"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_mcp_payload() {
        let text = r#"{"type":"mcp","payload":{"jsonrpc":"2.0","method":"tools/list","id":1}}"#;
        match InboundMessage::parse(text).unwrap() {
            InboundMessage::Mcp { payload } => {
                assert_eq!(payload["method"], "tools/list");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        assert!(matches!(
            InboundMessage::parse(r#"{"type":"telemetry"}"#),
            Err(ProtocolError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        assert!(matches!(
            InboundMessage::parse("{not json"),
            Err(ProtocolError::MalformedJson(_))
        ));
    }
}
