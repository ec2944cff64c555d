//! The session engine.
//!
//! [`SessionEngine`] is a cheap handle; the state lives in an actor task
//! that drains one command queue. User operations, one-shot replies,
//! duplex-channel events, and capture/playback events all arrive on that
//! queue, so every mutation is serialized and followed by exactly one
//! snapshot notification.
//!
//! Replies and channel events carry the epoch or channel sequence they
//! were issued under. After a role switch those numbers move on and late
//! arrivals are dropped instead of leaking into the new session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rolecall_core::config::{Config, PlaybackConfig};
use rolecall_core::error::{Result, RoleCallError};
use rolecall_core::protocol::{InboundFrame, StreamFrame};
use rolecall_core::types::{
    AudioSegment, MessageContent, MessageId, PermissionStatus, Role, Sender, TransportOrigin,
    TransportState,
};
use rolecall_media::{
    CaptureEvent, CaptureProvider, PlaybackEvent, SpeechPlaybackController, SpeechSynthesizer,
    Voice, VoiceCaptureController,
};
use rolecall_transport::{ChatBackend, DuplexChannel, StreamEvent, StreamOptions};

use crate::ordering::ReplyOrder;
use crate::session::{Session, SessionSnapshot};
use crate::subscribers::{channel_listener, Subscribers, Subscription};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Duplex channel settings. `None` disables voice streaming.
    pub stream: Option<StreamOptions>,
    pub playback: PlaybackConfig,
    pub capture_mime_type: String,
    /// Recordings held while the duplex channel is down.
    pub max_queued_audio: usize,
    /// Upper bound on one text turn, whatever the backend does.
    pub reply_timeout: Duration,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        let capture = config.capture();
        Self {
            stream: Some(StreamOptions::from_config(config)),
            playback: config.playback(),
            capture_mime_type: capture.mime_type,
            max_queued_audio: capture.max_queued_segments,
            reply_timeout: config.request_timeout(),
        }
    }

    /// One-shot text chat only.
    pub fn text_only() -> Self {
        let config = Config::default();
        Self {
            stream: None,
            ..Self::from_config(&config)
        }
    }
}

enum Command {
    SelectRole {
        role: Role,
        reply: oneshot::Sender<Result<()>>,
    },
    SendText {
        content: String,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    SendStreamText {
        content: String,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    SendAudio {
        segment: AudioSegment,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    OpenStream {
        reply: oneshot::Sender<Result<()>>,
    },
    Speak {
        message_id: MessageId,
        reply: oneshot::Sender<Result<()>>,
    },
    StopPlayback {
        reply: oneshot::Sender<()>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Reply {
        epoch: u64,
        ticket: u64,
        role_id: String,
        result: Result<String>,
    },
    Stream {
        seq: u64,
        event: StreamEvent,
    },
    Capture(CaptureEvent),
    Playback(PlaybackEvent),
}

pub struct SessionEngine {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Arc<SessionSnapshot>>,
    subscribers: Arc<Subscribers>,
    capture: Arc<VoiceCaptureController>,
    playback: Arc<SpeechPlaybackController>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEngine {
    /// Spawn the engine. Missing providers disable capture or playback;
    /// text chat works regardless.
    pub fn start(
        options: EngineOptions,
        backend: Arc<dyn ChatBackend>,
        capture_provider: Option<Arc<dyn CaptureProvider>>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    ) -> Self {
        let (capture, capture_rx) =
            VoiceCaptureController::new(capture_provider, options.capture_mime_type.clone());
        let (playback, playback_rx) = SpeechPlaybackController::new(synthesizer, &options.playback);
        let capture = Arc::new(capture);
        let playback = Arc::new(playback);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        forward(capture_rx, commands.clone(), Command::Capture);
        forward(playback_rx, commands.clone(), Command::Playback);

        let mut session = Session::new(&Uuid::new_v4().to_string());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(session.snapshot()));
        let subscribers = Subscribers::new();

        let actor = Actor {
            options,
            backend,
            capture: capture.clone(),
            playback: playback.clone(),
            commands: commands.clone(),
            subscribers: subscribers.clone(),
            snapshot_tx,
            session,
            order: ReplyOrder::default(),
            epoch: 0,
            stream: None,
            stream_seq: 0,
        };
        let task = tokio::spawn(actor.run(commands_rx));

        Self {
            commands,
            snapshot: snapshot_rx,
            subscribers,
            capture,
            playback,
            task: Mutex::new(Some(task)),
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| RoleCallError::EngineStopped)?;
        rx.await.map_err(|_| RoleCallError::EngineStopped)
    }

    /// Switch to `role`: tear down capture, playback, and the duplex
    /// channel, clear the conversation, and greet. Rejected with
    /// `InvalidState` while a capture or a handshake is in flight.
    pub async fn select_role(&self, role: Role) -> Result<()> {
        self.call(|reply| Command::SelectRole { role, reply })
            .await?
    }

    /// Send a text turn over the one-shot transport. Returns the id of the
    /// user message, which is appended before the request goes out.
    pub async fn send_text(&self, content: &str) -> Result<MessageId> {
        let content = content.to_string();
        self.call(|reply| Command::SendText { content, reply })
            .await?
    }

    /// Send a text turn over the connected duplex channel. The reply
    /// streams back as tokens and is coalesced into one message. Fails with
    /// `NotConnected`, leaving the conversation untouched, when the channel
    /// is not up; callers can fall back to [`send_text`](Self::send_text).
    pub async fn send_stream_text(&self, content: &str) -> Result<MessageId> {
        let content = content.to_string();
        self.call(|reply| Command::SendStreamText { content, reply })
            .await?
    }

    /// Send a captured segment over the duplex channel. When the channel
    /// is not connected the segment is queued and `TransportUnavailable`
    /// is returned; the user message is appended either way.
    pub async fn send_audio(&self, segment: AudioSegment) -> Result<MessageId> {
        self.call(|reply| Command::SendAudio { segment, reply })
            .await?
    }

    /// Reopen the duplex channel after it was lost or closed.
    pub async fn open_stream(&self) -> Result<()> {
        self.call(|reply| Command::OpenStream { reply }).await?
    }

    pub async fn request_permission(&self) -> Result<PermissionStatus> {
        self.capture.request_permission().await
    }

    pub async fn start_capture(&self) -> Result<()> {
        if self.snapshot().active_role.is_none() {
            return Err(RoleCallError::Precondition("no role selected".into()));
        }
        self.capture.start().await
    }

    /// Stop recording and send the segment.
    pub async fn stop_capture(&self) -> Result<MessageId> {
        let segment = self.capture.stop().await?;
        self.send_audio(segment).await
    }

    pub async fn cancel_capture(&self) {
        self.capture.cancel().await;
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.capture.set_muted(muted);
        self.call(|reply| Command::SetMuted { muted, reply }).await
    }

    /// Speak an AI message on demand.
    pub async fn speak(&self, message_id: MessageId) -> Result<()> {
        self.call(|reply| Command::Speak { message_id, reply })
            .await?
    }

    pub async fn stop_playback(&self) -> Result<()> {
        self.call(|reply| Command::StopPlayback { reply }).await
    }

    pub async fn pause_playback(&self) {
        self.playback.pause().await;
    }

    pub async fn resume_playback(&self) {
        self.playback.resume().await;
    }

    pub async fn set_volume(&self, scale: f32) {
        self.playback.set_volume_scale(scale).await;
    }

    pub fn voices(&self) -> Vec<Voice> {
        self.playback.voices()
    }

    pub async fn set_voice(&self, name: Option<&str>) -> Result<()> {
        self.playback.set_voice_override(name).await
    }

    /// The latest snapshot.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// A receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshot.clone()
    }

    /// Register a listener called once per mutation. It runs on the engine
    /// task and must not block.
    pub fn subscribe(
        &self,
        listener: impl Fn(Arc<SessionSnapshot>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe(Box::new(listener))
    }

    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Arc<SessionSnapshot>>) {
        let (listener, rx) = channel_listener();
        (self.subscribers.subscribe(listener), rx)
    }

    /// Cancel capture, stop playback, close the duplex channel, then stop
    /// the engine task.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown { reply });
    }
}

fn forward<T, F>(mut rx: mpsc::UnboundedReceiver<T>, commands: mpsc::UnboundedSender<Command>, wrap: F)
where
    T: Send + 'static,
    F: Fn(T) -> Command + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if commands.send(wrap(item)).is_err() {
                break;
            }
        }
    });
}

/// Run one request on its own task, bounded by `timeout`. A backend that
/// hangs or panics still produces an outcome, so later replies are released.
async fn bounded_reply(
    backend: Arc<dyn ChatBackend>,
    role_id: String,
    message: String,
    timeout: Duration,
) -> Result<String> {
    let request = tokio::spawn(async move { backend.request_reply(&role_id, &message).await });
    let abort = request.abort_handle();
    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(RoleCallError::Other(anyhow::Error::new(e).context("reply task failed"))),
        Err(_) => {
            abort.abort();
            Err(RoleCallError::Timeout(timeout))
        }
    }
}

/// Visible text for a failed turn.
fn failure_notice(error: &RoleCallError) -> String {
    match error {
        RoleCallError::Timeout(_) => "Sorry, the reply took too long. Please try again.".into(),
        RoleCallError::Network(_) => {
            "Sorry, I couldn't reach the server. Please try again.".into()
        }
        other => format!(
            "Sorry, something went wrong ({}). Please try again.",
            other.kind()
        ),
    }
}

struct Actor {
    options: EngineOptions,
    backend: Arc<dyn ChatBackend>,
    capture: Arc<VoiceCaptureController>,
    playback: Arc<SpeechPlaybackController>,
    commands: mpsc::UnboundedSender<Command>,
    subscribers: Arc<Subscribers>,
    snapshot_tx: watch::Sender<Arc<SessionSnapshot>>,
    session: Session,
    order: ReplyOrder<Result<String>>,
    /// Bumped on every role switch.
    epoch: u64,
    stream: Option<DuplexChannel>,
    /// Bumped on every channel open and teardown.
    stream_seq: u64,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(session_id = %self.session.session_id, "Session engine started");

        while let Some(command) = commands.recv().await {
            match command {
                Command::SelectRole { role, reply } => {
                    let _ = reply.send(self.select_role(role).await);
                }
                Command::SendText { content, reply } => {
                    let _ = reply.send(self.send_text(&content).await);
                }
                Command::SendStreamText { content, reply } => {
                    let _ = reply.send(self.send_stream_text(&content).await);
                }
                Command::SendAudio { segment, reply } => {
                    let _ = reply.send(self.send_audio(segment).await);
                }
                Command::OpenStream { reply } => {
                    let _ = reply.send(self.open_stream());
                }
                Command::Speak { message_id, reply } => {
                    let _ = reply.send(self.speak(message_id).await);
                }
                Command::StopPlayback { reply } => {
                    self.stop_playback().await;
                    let _ = reply.send(());
                }
                Command::SetMuted { muted, reply } => {
                    if self.session.muted != muted {
                        self.session.muted = muted;
                        self.publish();
                    }
                    let _ = reply.send(());
                }
                Command::Shutdown { reply } => {
                    self.teardown().await;
                    let _ = reply.send(());
                    break;
                }
                Command::Reply {
                    epoch,
                    ticket,
                    role_id,
                    result,
                } => self.on_reply(epoch, ticket, role_id, result).await,
                Command::Stream { seq, event } => self.on_stream_event(seq, event).await,
                Command::Capture(event) => self.on_capture_event(event),
                Command::Playback(event) => self.on_playback_event(event),
            }
        }

        info!(session_id = %self.session.session_id, "Session engine stopped");
    }

    fn publish(&mut self) {
        let snapshot = Arc::new(self.session.snapshot());
        self.snapshot_tx.send_replace(snapshot.clone());
        self.subscribers.notify(&snapshot);
    }

    fn role_id(&self) -> Option<&str> {
        self.session.role.as_ref().map(|r| r.id.as_str())
    }

    /// Cancel capture, stop playback, and close the channel, in that order.
    async fn teardown(&mut self) {
        self.capture.cancel().await;
        self.playback.stop().await;
        self.stream_seq += 1;
        if let Some(channel) = self.stream.take() {
            channel.close().await;
        }
    }

    async fn select_role(&mut self, role: Role) -> Result<()> {
        if self.capture.state().in_flight() {
            return Err(RoleCallError::InvalidState(
                "a capture is in progress".into(),
            ));
        }
        if self.session.transport_state == TransportState::Connecting {
            return Err(RoleCallError::InvalidState(
                "the duplex handshake is in progress".into(),
            ));
        }

        let previous = self.role_id().map(str::to_string);
        self.teardown().await;
        self.epoch += 1;
        self.order.reset();

        let session_id = Uuid::new_v4().to_string();
        self.session.reset(&session_id, role.clone());
        let greeting =
            self.session
                .append_text(Sender::Ai, &role.greeting(), TransportOrigin::Local);
        info!(
            role_id = %role.id,
            previous_role_id = previous.as_deref().unwrap_or("none"),
            %session_id,
            "Role selected"
        );

        self.connect_stream();
        if self.options.playback.auto_play {
            self.enqueue_playback(greeting).await;
        }
        self.publish();
        Ok(())
    }

    fn connect_stream(&mut self) {
        let (Some(options), Some(role)) = (&self.options.stream, &self.session.role) else {
            return;
        };
        self.stream_seq += 1;
        let seq = self.stream_seq;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = DuplexChannel::open(options.clone(), &self.session.session_id, &role.id, tx);
        forward(rx, self.commands.clone(), move |event| Command::Stream {
            seq,
            event,
        });
        self.session.transport_state = TransportState::Connecting;
        self.stream = Some(channel);
    }

    fn open_stream(&mut self) -> Result<()> {
        if self.options.stream.is_none() {
            return Err(RoleCallError::Unsupported(
                "duplex streaming is disabled".into(),
            ));
        }
        if self.session.role.is_none() {
            return Err(RoleCallError::Precondition("no role selected".into()));
        }
        if self.stream.is_some() {
            return Err(RoleCallError::InvalidState(
                "the duplex channel is already open".into(),
            ));
        }
        self.connect_stream();
        self.publish();
        Ok(())
    }

    /// Trimmed turn text and the active role id.
    fn text_turn<'a>(&self, content: &'a str) -> Result<(&'a str, String)> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RoleCallError::Precondition("message is empty".into()));
        }
        let role_id = self
            .role_id()
            .map(str::to_string)
            .ok_or_else(|| RoleCallError::Precondition("no role selected".into()))?;
        Ok((content, role_id))
    }

    async fn send_text(&mut self, content: &str) -> Result<MessageId> {
        let (content, role_id) = self.text_turn(content)?;

        self.finalize_stream_reply().await;
        let id = self
            .session
            .append_text(Sender::User, content, TransportOrigin::Http);
        let ticket = self.order.ticket();
        debug!(message_id = id, %role_id, ticket, "Dispatching text turn");

        let epoch = self.epoch;
        let backend = self.backend.clone();
        let commands = self.commands.clone();
        let message = content.to_string();
        let timeout = self.options.reply_timeout;
        tokio::spawn(async move {
            let result = bounded_reply(backend, role_id.clone(), message, timeout).await;
            let _ = commands.send(Command::Reply {
                epoch,
                ticket,
                role_id,
                result,
            });
        });

        self.publish();
        Ok(id)
    }

    async fn send_stream_text(&mut self, content: &str) -> Result<MessageId> {
        let (content, role_id) = self.text_turn(content)?;
        let channel = match &self.stream {
            Some(channel) if channel.state() == TransportState::Connected => channel,
            _ => return Err(RoleCallError::NotConnected),
        };
        // Tokens for this turn arrive on the command queue, so the user
        // message is always appended before them.
        channel.send_text(content).await?;

        self.finalize_stream_reply().await;
        let id = self
            .session
            .append_text(Sender::User, content, TransportOrigin::Stream);
        debug!(message_id = id, %role_id, "Text turn sent over duplex channel");
        self.publish();
        Ok(id)
    }

    async fn on_reply(&mut self, epoch: u64, ticket: u64, role_id: String, result: Result<String>) {
        if epoch != self.epoch {
            info!(
                stale_role_id = %role_id,
                current_role_id = self.role_id().unwrap_or("none"),
                "Dropping stale reply"
            );
            return;
        }

        let released = self.order.complete(ticket, result);
        if released.is_empty() {
            debug!(ticket, outstanding = self.order.outstanding(), "Reply held for ordering");
            return;
        }

        for outcome in released {
            match outcome {
                Ok(reply) => {
                    let id = self
                        .session
                        .append_text(Sender::Ai, &reply, TransportOrigin::Http);
                    debug!(message_id = id, %role_id, "Reply appended");
                    if self.options.playback.auto_play {
                        self.enqueue_playback(id).await;
                    }
                }
                Err(e) => {
                    warn!(%role_id, error = %e, kind = e.kind(), "Text turn failed");
                    self.session.append_text(
                        Sender::Ai,
                        &failure_notice(&e),
                        TransportOrigin::Local,
                    );
                }
            }
        }
        self.publish();
    }

    async fn send_audio(&mut self, segment: AudioSegment) -> Result<MessageId> {
        if self.session.role.is_none() {
            return Err(RoleCallError::Precondition("no role selected".into()));
        }

        self.finalize_stream_reply().await;
        let id = self.session.append(
            Sender::User,
            MessageContent::Audio {
                audio: segment.audio_ref(),
            },
            TransportOrigin::Stream,
        );

        let sent = match &self.stream {
            Some(channel) if channel.state() == TransportState::Connected => {
                match channel.send_audio(&segment).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(message_id = id, error = %e, "Audio send failed");
                        false
                    }
                }
            }
            _ => false,
        };

        if !sent {
            self.queue_audio(id, segment);
        }
        self.publish();

        if sent {
            Ok(id)
        } else {
            Err(RoleCallError::TransportUnavailable { queued: id })
        }
    }

    /// Hold a segment for the next connection, discarding the oldest once
    /// the queue is full.
    fn queue_audio(&mut self, id: MessageId, segment: AudioSegment) {
        let limit = self.options.max_queued_audio;
        if limit == 0 {
            info!(message_id = id, "Duplex channel unavailable, audio discarded");
            return;
        }
        let pending = &mut self.session.pending_audio;
        while pending.len() >= limit {
            if let Some(dropped) = pending.pop_front() {
                warn!(segment_id = %dropped.id, limit, "Audio queue full, oldest recording discarded");
            }
        }
        pending.push_back(segment);
        info!(
            message_id = id,
            queued = pending.len(),
            "Duplex channel unavailable, audio queued"
        );
    }

    async fn flush_pending_audio(&mut self) {
        let Some(channel) = &self.stream else {
            return;
        };
        while let Some(segment) = self.session.pending_audio.pop_front() {
            if let Err(e) = channel.send_audio(&segment).await {
                warn!(error = %e, "Flushing queued audio failed");
                self.session.pending_audio.push_front(segment);
                break;
            }
            debug!(segment_id = %segment.id, "Queued audio sent");
        }
    }

    async fn on_stream_event(&mut self, seq: u64, event: StreamEvent) {
        if seq != self.stream_seq {
            debug!(seq, current = self.stream_seq, "Ignoring event from a closed channel");
            return;
        }

        let changed = match event {
            StreamEvent::StateChanged(state) => self.on_transport_state(state).await,
            StreamEvent::Frame(frame) => self.on_frame(frame).await,
            StreamEvent::Malformed { error, .. } => {
                self.session.status = Some(format!("Ignored malformed frame: {error}"));
                true
            }
            StreamEvent::ReconnectScheduled { attempt, delay } => {
                self.session.retry_attempt = attempt;
                self.session.status = Some(format!(
                    "Reconnecting in {}ms (attempt {attempt})",
                    delay.as_millis()
                ));
                true
            }
            StreamEvent::ConnectionLost { attempts } => {
                warn!(attempts, "Duplex channel lost, voice disabled");
                self.finalize_stream_reply().await;
                self.stream = None;
                self.session.transport_state = TransportState::Disconnected;
                self.session.clock.stop();
                self.session.retry_attempt = attempts;
                self.session.status = Some(
                    "Connection lost. Voice is unavailable; text chat still works.".into(),
                );
                true
            }
            StreamEvent::Closed { code, reason } => {
                info!(?code, %reason, "Duplex channel closed");
                self.finalize_stream_reply().await;
                self.stream = None;
                self.session.transport_state = TransportState::Disconnected;
                self.session.clock.stop();
                if let Some(code) = code {
                    self.session.status =
                        Some(format!("Server closed the channel ({code}): {reason}"));
                }
                true
            }
        };

        if changed {
            self.publish();
        }
    }

    async fn on_transport_state(&mut self, state: TransportState) -> bool {
        if self.session.transport_state == state {
            return false;
        }
        debug!(from = ?self.session.transport_state, to = ?state, "Transport state");
        self.session.transport_state = state;
        match state {
            TransportState::Connected => {
                self.session.retry_attempt = 0;
                self.session.status = None;
                self.session.clock.start();
                self.flush_pending_audio().await;
            }
            TransportState::Degraded => {
                self.finalize_stream_reply().await;
            }
            TransportState::Disconnected => self.session.clock.stop(),
            TransportState::Connecting => {}
        }
        true
    }

    async fn on_frame(&mut self, frame: InboundFrame) -> bool {
        match frame {
            InboundFrame::Known(StreamFrame::LlmToken { token }) => {
                let extended = match self.session.streaming {
                    Some(id) => self.session.extend_text(id, &token),
                    None => false,
                };
                if !extended {
                    let id = self
                        .session
                        .append_text(Sender::Ai, &token, TransportOrigin::Stream);
                    self.session.streaming = Some(id);
                }
                true
            }
            InboundFrame::Known(frame) => {
                let finalized = self.finalize_stream_reply().await;
                self.apply_frame(frame) || finalized
            }
            InboundFrame::Untyped(value) => {
                debug!(%value, "Untyped frame");
                self.finalize_stream_reply().await
            }
        }
    }

    fn apply_frame(&mut self, frame: StreamFrame) -> bool {
        match frame {
            StreamFrame::LlmError { message } | StreamFrame::ChatError { message } => {
                warn!(%message, "Server reported a turn failure");
                self.session.append_text(
                    Sender::Ai,
                    &format!("Sorry, something went wrong: {message}"),
                    TransportOrigin::Local,
                );
                true
            }
            StreamFrame::SttStatus { message }
            | StreamFrame::SttProcessing { message }
            | StreamFrame::TtsInfo { message }
            | StreamFrame::TtsWarning { message } => {
                self.session.status = Some(message);
                true
            }
            StreamFrame::SttInterim { text } => {
                self.session.status = Some(text);
                true
            }
            StreamFrame::SttFinal { text } => {
                debug!(len = text.len(), "Transcript received");
                self.session.last_transcript = Some(text);
                true
            }
            StreamFrame::SttError { message } | StreamFrame::TtsError { message } => {
                warn!(%message, "Voice pipeline error");
                self.session.status = Some(message);
                true
            }
            StreamFrame::TtsChunk { seq, is_end, .. } => {
                debug!(seq, is_end, "Server audio chunk ignored");
                false
            }
            StreamFrame::LlmToken { .. } => false,
        }
    }

    /// Close the streamed reply, if any, and queue it for speech.
    async fn finalize_stream_reply(&mut self) -> bool {
        let Some(id) = self.session.streaming.take() else {
            return false;
        };
        debug!(message_id = id, "Streamed reply complete");
        if self.options.playback.auto_play {
            self.enqueue_playback(id).await;
        }
        true
    }

    async fn enqueue_playback(&mut self, id: MessageId) {
        if !self.playback.is_available() {
            return;
        }
        let Some(text) = self
            .session
            .message(id)
            .and_then(|m| m.text())
            .map(str::to_string)
        else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }
        let profile = self
            .session
            .role
            .as_ref()
            .map(|r| r.voice_profile.clone())
            .unwrap_or_default();
        self.session.playback_queue.push(id);
        self.playback.enqueue(id, &text, &profile).await;
    }

    async fn speak(&mut self, message_id: MessageId) -> Result<()> {
        let is_ai_text = self
            .session
            .message(message_id)
            .is_some_and(|m| m.sender == Sender::Ai && m.text().is_some());
        if !is_ai_text {
            return Err(RoleCallError::Precondition(format!(
                "message {message_id} is not an AI text message"
            )));
        }
        if !self.playback.is_available() {
            return Err(RoleCallError::Unsupported("speech synthesis".into()));
        }
        self.enqueue_playback(message_id).await;
        self.publish();
        Ok(())
    }

    async fn stop_playback(&mut self) {
        self.playback.stop().await;
        if self.session.playing.is_some() || !self.session.playback_queue.is_empty() {
            self.session.playing = None;
            self.session.playback_queue.clear();
            self.publish();
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::StateChanged(state) => {
                if self.session.capture_state == state {
                    return;
                }
                self.session.capture_state = state;
            }
            CaptureEvent::PermissionChanged(permission) => {
                self.session.permission = permission;
            }
            CaptureEvent::Error(reason) => {
                self.session.status = Some(format!("Microphone error: {reason}"));
            }
            CaptureEvent::Empty => {
                self.session.status = Some("Nothing was recorded.".into());
            }
            // Delivered to the caller of stop_capture.
            CaptureEvent::Segment(_) => return,
        }
        self.publish();
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        let queue = &mut self.session.playback_queue;
        match event {
            PlaybackEvent::Started(id) => {
                let Some(pos) = queue.iter().position(|q| *q == id) else {
                    return;
                };
                queue.remove(pos);
                self.session.playing = Some(id);
            }
            PlaybackEvent::Ended(id) => {
                if self.session.playing != Some(id) {
                    return;
                }
                self.session.playing = None;
            }
            PlaybackEvent::Failed { message_id, reason } => {
                let queued = queue.iter().position(|q| *q == message_id);
                if self.session.playing != Some(message_id) && queued.is_none() {
                    return;
                }
                warn!(message_id, %reason, "Playback failed");
                if let Some(pos) = queued {
                    queue.remove(pos);
                }
                if self.session.playing == Some(message_id) {
                    self.session.playing = None;
                }
                self.session.status = Some(format!("Playback failed: {reason}"));
            }
        }
        self.publish();
    }
}
