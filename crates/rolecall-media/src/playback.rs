//! Speech playback: a sequential queue of utterances, one per AI message.
//!
//! A single worker task drains the queue, so at most one utterance is
//! audible at a time. `stop()` bumps a generation counter under the same
//! lock the worker uses to emit events; anything the worker learns about an
//! older generation is dropped silently.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rolecall_core::config::PlaybackConfig;
use rolecall_core::error::{Result, RoleCallError};
use rolecall_core::types::{MessageId, VoiceProfile, DEFAULT_PITCH, DEFAULT_RATE, DEFAULT_VOLUME};

use crate::voice::{select_voice, Voice};

/// One synthesis request with its resolved voice parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub voice: Option<Voice>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

/// Speech-synthesis capability provider.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn voices(&self) -> Vec<Voice>;

    /// Speak and resolve when the utterance ends. Must resolve promptly
    /// (with either result) after [`cancel`](Self::cancel).
    async fn speak(&self, utterance: Utterance) -> Result<()>;

    /// Cut off the current utterance.
    fn cancel(&self);

    fn pause(&self) {}

    fn resume(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started(MessageId),
    Ended(MessageId),
    Failed { message_id: MessageId, reason: String },
}

#[derive(Debug, Clone)]
struct QueueEntry {
    message_id: MessageId,
    text: String,
    profile: VoiceProfile,
}

/// Fallback parameters for roles that leave them unset.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Defaults {
    rate: f32,
    pitch: f32,
    volume: f32,
}

struct Inner {
    queue: VecDeque<QueueEntry>,
    current: Option<MessageId>,
    generation: u64,
    paused: bool,
    volume_scale: f32,
    voice_override: Option<Voice>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    defaults: Defaults,
}

impl Shared {
    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }

    fn utterance(&self, inner: &Inner, entry: &QueueEntry, voices: &[Voice]) -> Utterance {
        let profile = &entry.profile;
        let voice = inner
            .voice_override
            .clone()
            .or_else(|| select_voice(voices, profile).cloned());
        let volume = profile.volume.unwrap_or(self.defaults.volume) * inner.volume_scale;
        Utterance {
            text: entry.text.clone(),
            voice,
            rate: profile.rate.unwrap_or(self.defaults.rate),
            pitch: profile.pitch.unwrap_or(self.defaults.pitch),
            volume: volume.clamp(0.0, 1.0),
        }
    }
}

pub struct SpeechPlaybackController {
    synth: Option<Arc<dyn SpeechSynthesizer>>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl SpeechPlaybackController {
    /// Create a controller and the receiver for its events. A `None`
    /// synthesizer makes every enqueue fail with `unsupported`.
    pub fn new(
        synth: Option<Arc<dyn SpeechSynthesizer>>,
        config: &PlaybackConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                current: None,
                generation: 0,
                paused: false,
                volume_scale: 1.0,
                voice_override: None,
            }),
            wake: Notify::new(),
            events,
            defaults: Defaults {
                rate: config.rate.unwrap_or(DEFAULT_RATE),
                pitch: config.pitch.unwrap_or(DEFAULT_PITCH),
                volume: config.volume.unwrap_or(DEFAULT_VOLUME),
            },
        });
        let shutdown = CancellationToken::new();

        if let Some(synth) = &synth {
            tokio::spawn(run_worker(shared.clone(), synth.clone(), shutdown.clone()));
        }

        let controller = Self {
            synth,
            shared,
            shutdown,
        };
        (controller, events_rx)
    }

    pub fn is_available(&self) -> bool {
        self.synth.is_some()
    }

    /// Queue a message for speech; starts at once if nothing is playing.
    pub async fn enqueue(&self, message_id: MessageId, text: &str, profile: &VoiceProfile) {
        if self.synth.is_none() {
            self.shared.emit(PlaybackEvent::Failed {
                message_id,
                reason: "speech synthesis unsupported".into(),
            });
            return;
        }
        let mut inner = self.shared.inner.lock().await;
        inner.queue.push_back(QueueEntry {
            message_id,
            text: text.to_string(),
            profile: profile.clone(),
        });
        debug!(message_id, queued = inner.queue.len(), "Playback enqueued");
        drop(inner);
        self.shared.wake.notify_one();
    }

    /// Cancel the current utterance and clear the queue. No further events
    /// are emitted for anything that was queued or playing.
    pub async fn stop(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.generation += 1;
        let cleared = inner.queue.len();
        inner.queue.clear();
        let current = inner.current.take();
        inner.paused = false;
        drop(inner);

        if let (Some(message_id), Some(synth)) = (current, &self.synth) {
            synth.cancel();
            info!(message_id, cleared, "Playback stopped");
        }
    }

    pub async fn pause(&self) {
        self.shared.inner.lock().await.paused = true;
        if let Some(synth) = &self.synth {
            synth.pause();
        }
    }

    pub async fn resume(&self) {
        self.shared.inner.lock().await.paused = false;
        if let Some(synth) = &self.synth {
            synth.resume();
        }
        self.shared.wake.notify_one();
    }

    pub async fn is_paused(&self) -> bool {
        self.shared.inner.lock().await.paused
    }

    /// Message currently being spoken.
    pub async fn current(&self) -> Option<MessageId> {
        self.shared.inner.lock().await.current
    }

    pub async fn queued(&self) -> Vec<MessageId> {
        let inner = self.shared.inner.lock().await;
        inner.queue.iter().map(|e| e.message_id).collect()
    }

    /// Global multiplier on every utterance's volume, clamped to `[0, 1]`.
    pub async fn set_volume_scale(&self, scale: f32) {
        self.shared.inner.lock().await.volume_scale = scale.clamp(0.0, 1.0);
    }

    pub fn voices(&self) -> Vec<Voice> {
        self.synth.as_ref().map(|s| s.voices()).unwrap_or_default()
    }

    /// Pin a voice by name for all utterances, or clear the pin with `None`.
    pub async fn set_voice_override(&self, name: Option<&str>) -> Result<()> {
        let voice = match name {
            Some(name) => Some(
                self.voices()
                    .into_iter()
                    .find(|v| v.name == name)
                    .ok_or_else(|| RoleCallError::Precondition(format!("unknown voice '{name}'")))?,
            ),
            None => None,
        };
        self.shared.inner.lock().await.voice_override = voice;
        Ok(())
    }
}

impl Drop for SpeechPlaybackController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    synth: Arc<dyn SpeechSynthesizer>,
    shutdown: CancellationToken,
) {
    loop {
        // Wait for an entry while not paused.
        let (message_id, generation, utterance) = loop {
            {
                let mut inner = shared.inner.lock().await;
                if !inner.paused && inner.current.is_none() {
                    if let Some(entry) = inner.queue.pop_front() {
                        let utterance = shared.utterance(&inner, &entry, &synth.voices());
                        inner.current = Some(entry.message_id);
                        shared.emit(PlaybackEvent::Started(entry.message_id));
                        break (entry.message_id, inner.generation, utterance);
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = shared.wake.notified() => {}
            }
        };

        debug!(message_id, rate = utterance.rate, pitch = utterance.pitch, "Speaking");
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                synth.cancel();
                return;
            }
            result = synth.speak(utterance) => result,
        };

        let mut inner = shared.inner.lock().await;
        if inner.generation != generation {
            continue;
        }
        inner.current = None;
        match result {
            Ok(()) => shared.emit(PlaybackEvent::Ended(message_id)),
            Err(e) => {
                warn!(message_id, error = %e, "Playback failed");
                shared.emit(PlaybackEvent::Failed {
                    message_id,
                    reason: e.to_string(),
                });
            }
        }
    }
}
