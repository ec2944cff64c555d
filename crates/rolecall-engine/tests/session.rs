//! Session engine tests with in-process fakes.
//!
//! Run with: `cargo test -p rolecall-engine --test session`

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rolecall_core::error::RoleCallError;
use rolecall_core::types::{AudioSegment, CaptureState, MessageContent, Sender, TransportOrigin, TransportState};

use rolecall_engine::{EngineOptions, Subscription};

use common::{sherlock, socrates, texts, wait_for, FakeBackend, Harness};

#[tokio::test]
async fn test_socrates_text_turn() {
    let h = Harness::text_only(FakeBackend::default(), true);
    h.engine.select_role(socrates()).await.unwrap();

    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.active_role.as_ref().unwrap().id, "socrates");
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].sender, Sender::Ai);
    assert_eq!(snapshot.messages[0].origin, TransportOrigin::Local);
    assert!(snapshot.messages[0].text().unwrap().contains("Socrates"));
    assert_eq!(snapshot.transport_state, TransportState::Disconnected);

    let id = h.engine.send_text("  What is virtue?  ").await.unwrap();
    let snapshot = wait_for(&h.engine, |s| s.messages.len() == 3).await;
    let user = snapshot.messages.iter().find(|m| m.id == id).unwrap();
    assert_eq!(user.text(), Some("What is virtue?"));
    assert_eq!(user.origin, TransportOrigin::Http);

    let reply = snapshot.last_message().unwrap();
    assert_eq!(reply.sender, Sender::Ai);
    assert_eq!(reply.origin, TransportOrigin::Http);
    assert_eq!(reply.text(), Some("socrates heard: What is virtue?"));
    assert!(reply.id > id);
    assert_eq!(
        h.backend.calls(),
        vec![("socrates".to_string(), "What is virtue?".to_string())]
    );

    // Greeting and reply are both spoken in Socrates' voice.
    wait_for(&h.engine, |s| s.playing.is_none() && s.playback_queue.is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let spoken = h.synth.spoken();
    assert_eq!(spoken.len(), 2);
    assert!((spoken[0].rate - 0.8).abs() < f32::EPSILON);
    assert!((spoken[0].pitch - 0.9).abs() < f32::EPSILON);
    assert_eq!(spoken[0].voice.as_ref().unwrap().name, "Daniel Male");
    assert_eq!(spoken[1].text, "socrates heard: What is virtue?");
}

#[tokio::test]
async fn test_replies_append_in_send_order() {
    let backend = FakeBackend::default().with_delay("first", Duration::from_millis(150));
    let h = Harness::text_only(backend, false);
    h.engine.select_role(socrates()).await.unwrap();

    h.engine.send_text("first").await.unwrap();
    h.engine.send_text("second").await.unwrap();

    let snapshot = wait_for(&h.engine, |s| s.messages.len() == 5).await;
    assert_eq!(
        texts(&snapshot)[1..],
        [
            "first",
            "second",
            "socrates heard: first",
            "socrates heard: second",
        ]
    );
}

#[tokio::test]
async fn test_stale_reply_dropped_after_role_switch() {
    let backend = FakeBackend::default().with_delay("hello", Duration::from_millis(100));
    let h = Harness::text_only(backend, false);
    h.engine.select_role(socrates()).await.unwrap();
    let first_session = h.engine.snapshot().session_id.clone();

    h.engine.send_text("hello").await.unwrap();
    h.engine.select_role(sherlock()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = h.engine.snapshot();
    assert_ne!(snapshot.session_id, first_session);
    assert_eq!(snapshot.active_role.as_ref().unwrap().id, "sherlock");
    assert_eq!(snapshot.messages.len(), 1);
    assert!(snapshot.messages[0].text().unwrap().contains("Sherlock Holmes"));
}

#[tokio::test]
async fn test_failed_turn_appends_local_notice() {
    let h = Harness::text_only(FakeBackend::default(), false);
    h.engine.select_role(socrates()).await.unwrap();

    h.engine.send_text("broken").await.unwrap();
    let snapshot = wait_for(&h.engine, |s| s.messages.len() == 3).await;
    let notice = snapshot.last_message().unwrap();
    assert_eq!(notice.sender, Sender::Ai);
    assert_eq!(notice.origin, TransportOrigin::Local);
    assert!(notice.text().unwrap().contains("couldn't reach the server"));

    h.engine.send_text("slowpoke").await.unwrap();
    let snapshot = wait_for(&h.engine, |s| s.messages.len() == 5).await;
    assert!(snapshot.last_message().unwrap().text().unwrap().contains("took too long"));
}

#[tokio::test]
async fn test_empty_send_rejected_without_notification() {
    let h = Harness::text_only(FakeBackend::default(), false);
    h.engine.select_role(socrates()).await.unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let _sub = h.engine.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let err = h.engine.send_text("   ").await.unwrap_err();
    assert!(matches!(err, RoleCallError::Precondition(_)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.snapshot().messages.len(), 1);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_send_without_role_rejected() {
    let h = Harness::text_only(FakeBackend::default(), false);
    let err = h.engine.send_text("hi").await.unwrap_err();
    assert_eq!(err.kind(), "precondition");

    let err = h.engine.start_capture().await.unwrap_err();
    assert_eq!(err.kind(), "precondition");
}

#[tokio::test]
async fn test_one_notification_per_mutation() {
    let h = Harness::text_only(FakeBackend::default(), false);
    let (sub, mut rx) = h.engine.subscribe_channel();

    h.engine.select_role(socrates()).await.unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.messages.len(), 1);

    h.engine.send_text("hi").await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(second.messages.len(), 2);
    let third = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.messages.len(), 3);
    assert!(first.version < second.version && second.version < third.version);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    sub.unsubscribe();
    h.engine.set_muted(true).await.unwrap();
    assert!(h.engine.snapshot().muted);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_audio_queued_without_duplex_channel() {
    let h = Harness::text_only(FakeBackend::default(), false);
    h.engine.select_role(socrates()).await.unwrap();

    h.engine.start_capture().await.unwrap();
    assert_eq!(
        wait_for(&h.engine, |s| s.capture_state == CaptureState::Recording)
            .await
            .capture_state,
        CaptureState::Recording
    );
    h.mic.feed(&[1, 2, 3]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = h.engine.stop_capture().await.unwrap_err();
    let RoleCallError::TransportUnavailable { queued } = err else {
        panic!("expected transport-unavailable, got {err:?}");
    };

    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.queued_audio, 1);
    let message = snapshot.messages.iter().find(|m| m.id == queued).unwrap();
    assert_eq!(message.sender, Sender::User);
    assert_eq!(message.origin, TransportOrigin::Stream);
    let MessageContent::Audio { audio } = &message.content else {
        panic!("expected audio content");
    };
    assert_eq!(audio.byte_len, 3);

    wait_for(&h.engine, |s| s.capture_state == CaptureState::Idle).await;
}

#[tokio::test]
async fn test_role_switch_rejected_while_recording() {
    let h = Harness::text_only(FakeBackend::default(), false);
    h.engine.select_role(socrates()).await.unwrap();
    h.engine.start_capture().await.unwrap();

    let err = h.engine.select_role(sherlock()).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(h.engine.snapshot().active_role.as_ref().unwrap().id, "socrates");

    h.engine.cancel_capture().await;
    h.engine.select_role(sherlock()).await.unwrap();
    assert_eq!(h.engine.snapshot().active_role.as_ref().unwrap().id, "sherlock");
}

#[tokio::test]
async fn test_manual_speak_and_stop() {
    let h = Harness::text_only(FakeBackend::default(), false);
    h.engine.select_role(socrates()).await.unwrap();
    let greeting = h.engine.snapshot().messages[0].id;

    h.engine.speak(greeting).await.unwrap();
    wait_for(&h.engine, |s| s.playing == Some(greeting)).await;
    h.engine.stop_playback().await.unwrap();

    let snapshot = h.engine.snapshot();
    assert!(snapshot.playing.is_none());
    assert!(snapshot.playback_queue.is_empty());
    assert_eq!(h.synth.spoken().len(), 1);

    let user = h.engine.send_text("hi").await.unwrap();
    let err = h.engine.speak(user).await.unwrap_err();
    assert_eq!(err.kind(), "precondition");
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let h = Harness::text_only(FakeBackend::default(), false);
    h.engine.select_role(socrates()).await.unwrap();
    h.engine.shutdown().await;

    let err = h.engine.send_text("hi").await.unwrap_err();
    assert!(matches!(err, RoleCallError::EngineStopped));
}

#[tokio::test]
async fn test_listener_dropping_its_subscription_does_not_stall() {
    let h = Harness::text_only(FakeBackend::default(), false);
    let hits = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let own = slot.clone();
    let counter = hits.clone();
    let sub = h.engine.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        own.lock().unwrap().take();
    });
    *slot.lock().unwrap() = Some(sub);

    tokio::time::timeout(Duration::from_secs(3), h.engine.select_role(socrates()))
        .await
        .expect("engine stalled while notifying")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(3), h.engine.send_text("hi"))
        .await
        .expect("engine stalled after unsubscribe")
        .unwrap();

    wait_for(&h.engine, |s| s.messages.len() == 3).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_queued_audio_is_capped() {
    let mut options = EngineOptions::text_only();
    options.playback.auto_play = false;
    options.max_queued_audio = 2;
    let h = Harness::with_options(options, FakeBackend::default());
    h.engine.select_role(socrates()).await.unwrap();

    let mut ids = Vec::new();
    for n in 1..=3u8 {
        let segment = AudioSegment::new("audio/webm", vec![n; 1024], None);
        match h.engine.send_audio(segment).await {
            Err(RoleCallError::TransportUnavailable { queued }) => ids.push(queued),
            other => panic!("expected transport-unavailable, got {other:?}"),
        }
    }

    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.queued_audio, 2);
    // Every recording stays in the transcript even when its bytes are gone.
    assert!(ids.iter().all(|id| snapshot.messages.iter().any(|m| m.id == *id)));
}

#[tokio::test]
async fn test_audio_not_kept_when_queue_disabled() {
    let mut options = EngineOptions::text_only();
    options.max_queued_audio = 0;
    let h = Harness::with_options(options, FakeBackend::default());
    h.engine.select_role(socrates()).await.unwrap();

    let err = h
        .engine
        .send_audio(AudioSegment::new("audio/webm", vec![1, 2], None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "transport_unavailable");
    assert_eq!(h.engine.snapshot().queued_audio, 0);
}

#[tokio::test]
async fn test_hung_or_panicking_backend_does_not_block_later_replies() {
    let mut options = EngineOptions::text_only();
    options.playback.auto_play = false;
    options.reply_timeout = Duration::from_millis(150);
    let backend = FakeBackend::default().with_delay("hang", Duration::from_secs(30));
    let h = Harness::with_options(options, backend);
    h.engine.select_role(socrates()).await.unwrap();

    h.engine.send_text("hang").await.unwrap();
    h.engine.send_text("panic").await.unwrap();
    h.engine.send_text("after").await.unwrap();

    let snapshot = wait_for(&h.engine, |s| s.messages.len() == 7).await;
    let lines = texts(&snapshot);
    assert!(lines[4].contains("took too long"), "{lines:?}");
    assert!(lines[5].contains("something went wrong (other)"), "{lines:?}");
    assert_eq!(lines[6], "socrates heard: after");
    assert_eq!(snapshot.messages[5].origin, TransportOrigin::Local);
}
