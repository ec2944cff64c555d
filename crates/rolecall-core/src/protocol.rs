//! Wire protocol shared with the chat server.
//!
//! One-shot calls are JSON over HTTP. The duplex channel carries JSON text
//! frames in both directions plus binary audio frames from the client.

use serde::{Deserialize, Serialize};

pub const ROLES_PATH: &str = "/api/roles/";
pub const CHAT_TEXT_PATH: &str = "/api/chat/text";
pub const HEALTH_PATH: &str = "/health";

/// Path of a single role record.
pub fn role_path(role_id: &str) -> String {
    format!("{ROLES_PATH}{role_id}")
}

/// Path of the duplex session endpoint.
pub fn stream_path(session_id: &str, role_id: &str) -> String {
    format!("/ws/api/session/{session_id}/{role_id}")
}

/// `POST /api/chat/text` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTextRequest {
    pub role_id: String,
    pub message: String,
}

/// `POST /api/chat/text` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTextReply {
    pub reply: String,
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Outbound text frame on the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOutbound {
    pub text: String,
}

/// Inbound frames the server is known to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamFrame {
    /// One token of a streaming reply.
    #[serde(rename = "llm-token")]
    LlmToken { token: String },
    #[serde(rename = "llm-error")]
    LlmError { message: String },
    #[serde(rename = "chat-error")]
    ChatError { message: String },
    #[serde(rename = "stt-status")]
    SttStatus {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "stt-processing")]
    SttProcessing {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "stt-interim")]
    SttInterim { text: String },
    /// Final transcript of the user's uploaded audio.
    #[serde(rename = "stt-final")]
    SttFinal { text: String },
    #[serde(rename = "stt-error")]
    SttError { message: String },
    #[serde(rename = "tts-chunk")]
    TtsChunk {
        #[serde(default)]
        audio: String,
        #[serde(default)]
        seq: u64,
        #[serde(default)]
        is_end: bool,
    },
    #[serde(rename = "tts-info")]
    TtsInfo {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "tts-warning")]
    TtsWarning {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "tts-error")]
    TtsError { message: String },
}

/// A decoded inbound frame: either a known frame type or arbitrary JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Known(StreamFrame),
    Untyped(serde_json::Value),
}

impl InboundFrame {
    /// Decode a text frame. Fails only if the text is not valid JSON.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match StreamFrame::deserialize(&value) {
            Ok(frame) => Ok(Self::Known(frame)),
            Err(_) => Ok(Self::Untyped(value)),
        }
    }
}
