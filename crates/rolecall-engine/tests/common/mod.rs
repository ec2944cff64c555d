#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use rolecall_core::error::{Result, RoleCallError};
use rolecall_core::types::{Role, VoiceGender, VoiceProfile};
use rolecall_engine::{EngineOptions, SessionEngine, SessionSnapshot};
use rolecall_media::{CaptureProvider, CaptureTrack, SpeechSynthesizer, Utterance, Voice};
use rolecall_transport::ChatBackend;

pub fn socrates() -> Role {
    Role {
        id: "socrates".into(),
        name: "Socrates".into(),
        description: "Ask me anything about virtue.".into(),
        avatar_url: None,
        voice_profile: VoiceProfile {
            rate: Some(0.8),
            pitch: Some(0.9),
            volume: None,
            preferred_languages: vec!["en-GB".into(), "en".into()],
            gender: Some(VoiceGender::Male),
        },
    }
}

pub fn sherlock() -> Role {
    Role {
        id: "sherlock".into(),
        name: "Sherlock Holmes".into(),
        description: String::new(),
        avatar_url: None,
        voice_profile: VoiceProfile::default(),
    }
}

/// Backend that answers `"{role} heard: {message}"`. Messages listed in
/// `delays` are held back; `"broken"` fails with a network error,
/// `"slowpoke"` times out, and `"panic"` panics.
#[derive(Default)]
pub struct FakeBackend {
    pub delays: HashMap<String, Duration>,
    pub calls: StdMutex<Vec<(String, String)>>,
}

impl FakeBackend {
    pub fn with_delay(mut self, message: &str, delay: Duration) -> Self {
        self.delays.insert(message.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(vec![socrates(), sherlock()])
    }

    async fn request_reply(&self, role_id: &str, message: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((role_id.to_string(), message.to_string()));
        if let Some(delay) = self.delays.get(message) {
            tokio::time::sleep(*delay).await;
        }
        match message {
            "broken" => Err(RoleCallError::Network("HTTP 503: unavailable".into())),
            "slowpoke" => Err(RoleCallError::Timeout(Duration::from_secs(15))),
            "panic" => panic!("backend bug"),
            _ => Ok(format!("{role_id} heard: {message}")),
        }
    }
}

/// Synthesizer that records utterances and speaks for a fixed time.
pub struct FakeSynth {
    pub spoken: StdMutex<Vec<Utterance>>,
    duration: Duration,
    interrupt: Notify,
}

impl FakeSynth {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            spoken: StdMutex::new(Vec::new()),
            duration,
            interrupt: Notify::new(),
        })
    }

    pub fn spoken(&self) -> Vec<Utterance> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    fn voices(&self) -> Vec<Voice> {
        vec![
            Voice::new("Daniel Male", "en-GB"),
            Voice::new("Samantha Female", "en-US").with_default(true),
        ]
    }

    async fn speak(&self, utterance: Utterance) -> Result<()> {
        self.spoken.lock().unwrap().push(utterance);
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(()),
            _ = self.interrupt.notified() => Err(RoleCallError::Device("interrupted".into())),
        }
    }

    fn cancel(&self) {
        self.interrupt.notify_waiters();
    }
}

/// Microphone whose tracks are fed by the test.
#[derive(Default)]
pub struct FakeMic {
    pub deny: AtomicBool,
    feeds: StdMutex<Vec<mpsc::UnboundedSender<std::result::Result<Vec<u8>, String>>>>,
}

impl FakeMic {
    pub fn feed(&self, bytes: &[u8]) {
        let feeds = self.feeds.lock().unwrap();
        feeds.last().unwrap().send(Ok(bytes.to_vec())).unwrap();
    }
}

#[async_trait]
impl CaptureProvider for FakeMic {
    async fn probe(&self) -> Result<()> {
        if self.deny.load(Ordering::SeqCst) {
            Err(RoleCallError::PermissionDenied)
        } else {
            Ok(())
        }
    }

    async fn acquire(&self, _mime_type: &str) -> Result<CaptureTrack> {
        self.probe().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push(tx);
        Ok(CaptureTrack {
            chunks: rx,
            release: CancellationToken::new(),
        })
    }
}

pub struct Harness {
    pub engine: SessionEngine,
    pub backend: Arc<FakeBackend>,
    pub synth: Arc<FakeSynth>,
    pub mic: Arc<FakeMic>,
}

impl Harness {
    pub fn text_only(backend: FakeBackend, auto_play: bool) -> Self {
        let mut options = EngineOptions::text_only();
        options.playback.auto_play = auto_play;
        Self::with_options(options, backend)
    }

    pub fn with_options(options: EngineOptions, backend: FakeBackend) -> Self {
        let backend = Arc::new(backend);
        let synth = FakeSynth::new(Duration::from_millis(200));
        let mic = Arc::new(FakeMic::default());
        let engine = SessionEngine::start(
            options,
            backend.clone(),
            Some(mic.clone()),
            Some(synth.clone()),
        );
        Self {
            engine,
            backend,
            synth,
            mic,
        }
    }
}

/// Wait until `pred` holds for the engine's latest snapshot.
pub async fn wait_for(
    engine: &SessionEngine,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> Arc<SessionSnapshot> {
    let mut watch = engine.watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = watch.borrow_and_update().clone();
            if pred(&snapshot) {
                return snapshot;
            }
            if watch.changed().await.is_err() {
                panic!("engine stopped");
            }
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

pub fn texts(snapshot: &SessionSnapshot) -> Vec<String> {
    snapshot
        .messages
        .iter()
        .map(|m| m.text().unwrap_or("<audio>").to_string())
        .collect()
}
