//! Voice capture: microphone permission and the recording state machine.
//!
//! `idle → requesting_permission → idle | recording`, `recording → (stop) →
//! encoding → idle`, and any state → `error` on device failure. Exactly one
//! capture is in flight at a time. The live track is released the moment
//! `stop()` or a device error happens, before the segment is assembled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rolecall_core::error::{Result, RoleCallError};
use rolecall_core::types::{AudioSegment, CaptureState, PermissionStatus};

/// A live audio track handed out by a [`CaptureProvider`].
pub struct CaptureTrack {
    /// Encoded chunks as the device produces them. An `Err` is a device
    /// failure and ends the capture.
    pub chunks: mpsc::UnboundedReceiver<std::result::Result<Vec<u8>, String>>,
    /// Cancelled by the controller to release the device.
    pub release: CancellationToken,
}

/// Microphone capability provider.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Probe the device once. `Err(PermissionDenied)` on denial; the probe
    /// must not keep the device open.
    async fn probe(&self) -> Result<()>;

    /// Open a live track encoding to `mime_type`.
    async fn acquire(&self, mime_type: &str) -> Result<CaptureTrack>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    StateChanged(CaptureState),
    PermissionChanged(PermissionStatus),
    Segment(AudioSegment),
    /// `stop()` found no buffered bytes; no segment was emitted.
    Empty,
    Error(String),
}

struct Recording {
    generation: u64,
    release: CancellationToken,
    pump: JoinHandle<std::result::Result<Vec<u8>, String>>,
    started: Instant,
}

struct Inner {
    state: CaptureState,
    permission: PermissionStatus,
    recording: Option<Recording>,
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Mirror of `Inner::state` readable without awaiting the lock, which
    /// `start()` holds across device acquisition.
    state: watch::Sender<CaptureState>,
    muted: AtomicBool,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

impl Shared {
    fn emit(&self, event: CaptureEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, inner: &mut Inner, state: CaptureState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "Capture state changed");
            inner.state = state;
            self.state.send_replace(state);
            self.emit(CaptureEvent::StateChanged(state));
        }
    }

    fn set_permission(&self, inner: &mut Inner, permission: PermissionStatus) {
        if inner.permission != permission {
            inner.permission = permission;
            self.emit(CaptureEvent::PermissionChanged(permission));
        }
    }

    /// Device failure reported by the pump. Ignored if `stop()` or
    /// `cancel()` already took this recording.
    async fn fail_recording(&self, generation: u64, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.recording.as_ref().map(|r| r.generation) != Some(generation) {
            return;
        }
        inner.recording = None;
        warn!(%reason, "Capture device failed");
        self.set_state(&mut inner, CaptureState::Error);
        self.emit(CaptureEvent::Error(reason.to_string()));
    }
}

pub struct VoiceCaptureController {
    provider: Option<Arc<dyn CaptureProvider>>,
    mime_type: String,
    shared: Arc<Shared>,
}

impl VoiceCaptureController {
    /// Create a controller and the receiver for its events. A `None`
    /// provider disables capture.
    pub fn new(
        provider: Option<Arc<dyn CaptureProvider>>,
        mime_type: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: CaptureState::Idle,
                permission: PermissionStatus::Unknown,
                recording: None,
                generation: 0,
            }),
            state: watch::Sender::new(CaptureState::Idle),
            muted: AtomicBool::new(false),
            events,
        });
        let controller = Self {
            provider,
            mime_type: mime_type.into(),
            shared,
        };
        (controller, events_rx)
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    pub fn state(&self) -> CaptureState {
        *self.shared.state.borrow()
    }

    pub async fn permission(&self) -> PermissionStatus {
        self.shared.inner.lock().await.permission
    }

    /// Discard incoming chunks while muted. The track stays open.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
        debug!(muted, "Capture mute toggled");
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    fn provider(&self) -> Result<&Arc<dyn CaptureProvider>> {
        self.provider
            .as_ref()
            .ok_or_else(|| RoleCallError::Unsupported("microphone capture".into()))
    }

    /// Probe the microphone. A denial is sticky until the next probe.
    pub async fn request_permission(&self) -> Result<PermissionStatus> {
        let provider = self.provider()?.clone();
        let mut inner = self.shared.inner.lock().await;
        if !matches!(inner.state, CaptureState::Idle | CaptureState::Error) {
            return Err(RoleCallError::AlreadyRecording);
        }

        self.shared
            .set_state(&mut inner, CaptureState::RequestingPermission);
        match provider.probe().await {
            Ok(()) => {
                self.shared
                    .set_permission(&mut inner, PermissionStatus::Granted);
                self.shared.set_state(&mut inner, CaptureState::Idle);
            }
            Err(RoleCallError::PermissionDenied) => {
                info!("Microphone permission denied");
                self.shared
                    .set_permission(&mut inner, PermissionStatus::Denied);
                self.shared.set_state(&mut inner, CaptureState::Idle);
            }
            Err(e) => {
                self.shared.set_state(&mut inner, CaptureState::Error);
                self.shared.emit(CaptureEvent::Error(e.to_string()));
                return Err(e);
            }
        }
        Ok(inner.permission)
    }

    /// Begin recording. Accepted from `idle` or `error`.
    pub async fn start(&self) -> Result<()> {
        let provider = self.provider()?.clone();
        let mut inner = self.shared.inner.lock().await;
        if inner.permission == PermissionStatus::Denied {
            return Err(RoleCallError::PermissionDenied);
        }
        if !matches!(inner.state, CaptureState::Idle | CaptureState::Error) {
            return Err(RoleCallError::AlreadyRecording);
        }

        self.shared
            .set_state(&mut inner, CaptureState::RequestingPermission);
        let track = match provider.acquire(&self.mime_type).await {
            Ok(track) => track,
            Err(RoleCallError::PermissionDenied) => {
                self.shared
                    .set_permission(&mut inner, PermissionStatus::Denied);
                self.shared.set_state(&mut inner, CaptureState::Idle);
                return Err(RoleCallError::PermissionDenied);
            }
            Err(e) => {
                warn!(error = %e, "Failed to acquire capture track");
                self.shared.set_state(&mut inner, CaptureState::Error);
                self.shared.emit(CaptureEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        self.shared
            .set_permission(&mut inner, PermissionStatus::Granted);
        inner.generation += 1;
        let generation = inner.generation;
        let release = track.release.clone();
        let pump = tokio::spawn(pump(
            self.shared.clone(),
            generation,
            track.chunks,
            track.release,
        ));
        inner.recording = Some(Recording {
            generation,
            release,
            pump,
            started: Instant::now(),
        });
        self.shared.set_state(&mut inner, CaptureState::Recording);
        info!(generation, mime_type = %self.mime_type, "Capture started");
        Ok(())
    }

    /// Finish recording and return the segment, which is also emitted once
    /// as [`CaptureEvent::Segment`]. Zero buffered bytes yields
    /// `EmptyCapture` and no segment.
    pub async fn stop(&self) -> Result<AudioSegment> {
        let recording = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state != CaptureState::Recording {
                return Err(RoleCallError::NotRecording);
            }
            let recording = inner.recording.take().ok_or(RoleCallError::NotRecording)?;
            self.shared.set_state(&mut inner, CaptureState::Encoding);
            recording
        };

        recording.release.cancel();
        let duration_ms = recording.started.elapsed().as_millis() as u64;
        let outcome = recording.pump.await;

        let mut inner = self.shared.inner.lock().await;
        match outcome {
            Ok(Ok(data)) if data.is_empty() => {
                debug!("Capture produced no audio");
                self.shared.set_state(&mut inner, CaptureState::Idle);
                self.shared.emit(CaptureEvent::Empty);
                Err(RoleCallError::EmptyCapture)
            }
            Ok(Ok(data)) => {
                let segment = AudioSegment::new(self.mime_type.clone(), data, Some(duration_ms));
                info!(
                    segment_id = %segment.id,
                    bytes = segment.data.len(),
                    duration_ms,
                    "Capture segment ready"
                );
                self.shared.set_state(&mut inner, CaptureState::Idle);
                self.shared.emit(CaptureEvent::Segment(segment.clone()));
                Ok(segment)
            }
            Ok(Err(reason)) => {
                self.shared.set_state(&mut inner, CaptureState::Error);
                self.shared.emit(CaptureEvent::Error(reason.clone()));
                Err(RoleCallError::Device(reason))
            }
            Err(e) => {
                let reason = format!("capture task failed: {e}");
                self.shared.set_state(&mut inner, CaptureState::Error);
                self.shared.emit(CaptureEvent::Error(reason.clone()));
                Err(RoleCallError::Device(reason))
            }
        }
    }

    /// Abandon any capture in flight without emitting a segment.
    pub async fn cancel(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(recording) = inner.recording.take() {
            recording.release.cancel();
            recording.pump.abort();
            info!(generation = recording.generation, "Capture cancelled");
        }
        self.shared.set_state(&mut inner, CaptureState::Idle);
    }
}

/// Collect chunks until the track is released or ends. Muted and
/// zero-length chunks are dropped.
async fn pump(
    shared: Arc<Shared>,
    generation: u64,
    mut chunks: mpsc::UnboundedReceiver<std::result::Result<Vec<u8>, String>>,
    release: CancellationToken,
) -> std::result::Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let accept = |buffer: &mut Vec<u8>, bytes: Vec<u8>| {
        if !bytes.is_empty() && !shared.muted.load(Ordering::SeqCst) {
            buffer.extend_from_slice(&bytes);
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = release.cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(Ok(bytes)) => accept(&mut buffer, bytes),
                Some(Err(reason)) => {
                    release.cancel();
                    shared.fail_recording(generation, &reason).await;
                    return Err(reason);
                }
                None => break,
            },
        }
    }

    // Chunks delivered before the release still belong to this segment.
    while let Ok(Ok(bytes)) = chunks.try_recv() {
        accept(&mut buffer, bytes);
    }
    Ok(buffer)
}
