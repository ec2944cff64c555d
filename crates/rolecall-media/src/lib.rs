//! Media controllers: microphone capture and speech playback.
//!
//! The devices themselves are capability providers injected through
//! [`capture::CaptureProvider`] and [`playback::SpeechSynthesizer`]; either
//! may be absent, in which case the matching controller reports
//! `Unsupported` and text chat is unaffected.

pub mod capture;
pub mod playback;
pub mod voice;

pub use capture::{CaptureEvent, CaptureProvider, CaptureTrack, VoiceCaptureController};
pub use playback::{PlaybackEvent, SpeechPlaybackController, SpeechSynthesizer, Utterance};
pub use voice::{select_voice, Voice};
