//! Data model: roles, voice profiles, messages, and the observable states
//! of the capture, playback, and transport state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default speech rate when a role does not declare one.
pub const DEFAULT_RATE: f32 = 0.9;
/// Default speech pitch when a role does not declare one.
pub const DEFAULT_PITCH: f32 = 1.0;
/// Default speech volume when a role does not declare one.
pub const DEFAULT_VOLUME: f32 = 0.8;

/// Gender tag used by the voice-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceGender {
    Male,
    Female,
}

/// Per-role speech parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    /// Language tags in preference order (e.g. `["en-GB", "en"]`).
    #[serde(default, alias = "preferred_languages")]
    pub preferred_languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<VoiceGender>,
}

impl VoiceProfile {
    pub fn rate(&self) -> f32 {
        self.rate.unwrap_or(DEFAULT_RATE)
    }

    pub fn pitch(&self) -> f32 {
        self.pitch.unwrap_or(DEFAULT_PITCH)
    }

    pub fn volume(&self) -> f32 {
        self.volume.unwrap_or(DEFAULT_VOLUME)
    }
}

/// A selectable AI persona. Owned by the role catalog, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, rename = "voiceProfile", alias = "voice_profile")]
    pub voice_profile: VoiceProfile,
}

impl Role {
    /// The synthesized first message of a fresh session.
    pub fn greeting(&self) -> String {
        if self.description.trim().is_empty() {
            format!("Hello, I am {}.", self.name)
        } else {
            format!("Hello, I am {}. {}", self.name, self.description.trim())
        }
    }
}

/// Monotonic per-session message sequence number.
pub type MessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Ai,
}

/// Which path produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportOrigin {
    Http,
    Stream,
    /// Synthesized by the engine itself (greeting, failure notice).
    Local,
}

/// Reference to a captured audio segment attached to a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRef {
    pub segment_id: Uuid,
    pub mime_type: String,
    pub byte_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Audio { audio: AudioRef },
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Audio { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub origin: TransportOrigin,
}

impl Message {
    pub fn text(&self) -> Option<&str> {
        self.content.as_text()
    }
}

/// One complete encoded recording produced between capture start and stop.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub id: Uuid,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub duration_ms: Option<u64>,
}

impl AudioSegment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>, duration_ms: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mime_type: mime_type.into(),
            data,
            duration_ms,
        }
    }

    pub fn audio_ref(&self) -> AudioRef {
        AudioRef {
            segment_id: self.id,
            mime_type: self.mime_type.clone(),
            byte_len: self.data.len(),
            duration_ms: self.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    RequestingPermission,
    Recording,
    Encoding,
    Error,
}

impl CaptureState {
    /// Whether a capture operation is underway (anything but idle/error).
    pub fn in_flight(self) -> bool {
        matches!(self, Self::RequestingPermission | Self::Recording | Self::Encoding)
    }
}

/// Outcome of the last microphone probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    #[default]
    Unknown,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}
