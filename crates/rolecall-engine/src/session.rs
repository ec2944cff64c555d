//! Session state and its immutable snapshot.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;

use rolecall_core::types::{
    AudioSegment, CaptureState, Message, MessageContent, MessageId, PermissionStatus, Role,
    Sender, TransportOrigin, TransportState,
};

use crate::clock::{format_call_duration, CallClock};

/// What subscribers see after each mutation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Bumped once per mutation.
    pub version: u64,
    pub session_id: String,
    pub active_role: Option<Role>,
    pub messages: Vec<Message>,
    pub capture_state: CaptureState,
    pub permission: PermissionStatus,
    pub muted: bool,
    /// Messages waiting to be spoken, in order.
    pub playback_queue: Vec<MessageId>,
    pub playing: Option<MessageId>,
    pub transport_state: TransportState,
    /// Reconnect attempt of the current cycle; 0 while healthy.
    pub retry_attempt: u32,
    /// Audio segments waiting for the duplex channel.
    pub queued_audio: usize,
    /// Latest voice pipeline status line.
    pub status: Option<String>,
    pub last_transcript: Option<String>,
    /// AI message still receiving streamed tokens.
    pub streaming: Option<MessageId>,
    #[serde(skip)]
    pub connected_since: Option<Instant>,
}

impl SessionSnapshot {
    pub fn empty(session_id: &str) -> Self {
        Session::new(session_id).snapshot()
    }

    /// Time since the duplex channel first connected in this session.
    pub fn call_duration(&self) -> Option<Duration> {
        self.connected_since.map(|since| since.elapsed())
    }

    /// `mm:ss` call duration, `00:00` before the channel connects.
    pub fn call_duration_label(&self) -> String {
        format_call_duration(self.call_duration().unwrap_or_default())
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Mutable session state, owned by the engine task.
#[derive(Debug)]
pub(crate) struct Session {
    pub session_id: String,
    pub role: Option<Role>,
    pub messages: Vec<Message>,
    next_id: MessageId,
    pub capture_state: CaptureState,
    pub permission: PermissionStatus,
    pub muted: bool,
    pub playback_queue: Vec<MessageId>,
    pub playing: Option<MessageId>,
    pub transport_state: TransportState,
    pub retry_attempt: u32,
    pub pending_audio: VecDeque<AudioSegment>,
    pub status: Option<String>,
    pub last_transcript: Option<String>,
    pub clock: CallClock,
    /// AI message currently receiving streamed tokens.
    pub streaming: Option<MessageId>,
    version: u64,
}

impl Session {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: None,
            messages: Vec::new(),
            next_id: 1,
            capture_state: CaptureState::Idle,
            permission: PermissionStatus::Unknown,
            muted: false,
            playback_queue: Vec::new(),
            playing: None,
            transport_state: TransportState::Disconnected,
            retry_attempt: 0,
            pending_audio: VecDeque::new(),
            status: None,
            last_transcript: None,
            clock: CallClock::default(),
            streaming: None,
            version: 0,
        }
    }

    /// Start over with a new role. Permission and mute survive: they belong
    /// to the device, not the conversation.
    pub fn reset(&mut self, session_id: &str, role: Role) {
        let permission = self.permission;
        let muted = self.muted;
        let version = self.version;
        *self = Self::new(session_id);
        self.permission = permission;
        self.muted = muted;
        self.version = version;
        self.role = Some(role);
    }

    pub fn append(
        &mut self,
        sender: Sender,
        content: MessageContent,
        origin: TransportOrigin,
    ) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(Message {
            id,
            sender,
            content,
            timestamp: Utc::now(),
            origin,
        });
        id
    }

    pub fn append_text(&mut self, sender: Sender, text: &str, origin: TransportOrigin) -> MessageId {
        self.append(
            sender,
            MessageContent::Text {
                text: text.to_string(),
            },
            origin,
        )
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.id == id)
    }

    /// Extend a streamed reply in place.
    pub fn extend_text(&mut self, id: MessageId, token: &str) -> bool {
        let Some(message) = self.messages.iter_mut().rev().find(|m| m.id == id) else {
            return false;
        };
        match &mut message.content {
            MessageContent::Text { text } => {
                text.push_str(token);
                true
            }
            MessageContent::Audio { .. } => false,
        }
    }

    pub fn snapshot(&mut self) -> SessionSnapshot {
        self.version += 1;
        SessionSnapshot {
            version: self.version,
            session_id: self.session_id.clone(),
            active_role: self.role.clone(),
            messages: self.messages.clone(),
            capture_state: self.capture_state,
            permission: self.permission,
            muted: self.muted,
            playback_queue: self.playback_queue.clone(),
            playing: self.playing,
            transport_state: self.transport_state,
            retry_attempt: self.retry_attempt,
            queued_audio: self.pending_audio.len(),
            status: self.status.clone(),
            last_transcript: self.last_transcript.clone(),
            streaming: self.streaming,
            connected_since: self.clock.started(),
        }
    }
}
