use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoleCallError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stream is not connected")]
    NotConnected,

    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    #[error("Duplex transport unavailable; audio message {queued} queued")]
    TransportUnavailable { queued: u64 },

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("A capture is already in progress")]
    AlreadyRecording,

    #[error("No capture is in progress")]
    NotRecording,

    #[error("Capture produced no audio")]
    EmptyCapture,

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Engine stopped")]
    EngineStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RoleCallError {
    /// Stable snake_case label for log fields and failure notices.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "precondition",
            Self::InvalidState(_) => "invalid_state",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::NotConnected => "not_connected",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::TransportUnavailable { .. } => "transport_unavailable",
            Self::PermissionDenied => "permission_denied",
            Self::AlreadyRecording => "already_recording",
            Self::NotRecording => "not_recording",
            Self::EmptyCapture => "empty_capture",
            Self::Unsupported(_) => "unsupported",
            Self::Device(_) => "device",
            Self::Decode(_) => "decode",
            Self::Config(_) => "config",
            Self::EngineStopped => "engine_stopped",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }

    /// Whether the failure came from the network path (HTTP or stream).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::NotConnected | Self::ConnectionLost { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RoleCallError>;
