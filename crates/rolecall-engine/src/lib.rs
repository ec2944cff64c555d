//! Session engine. Owns conversation state and coordinates the transport,
//! capture, and playback state machines.
//!
//! Every mutation runs on one actor task fed by a single command queue, so
//! user actions and network events never interleave a message append.

pub mod clock;
pub mod engine;
pub mod ordering;
pub mod session;
pub mod subscribers;

pub use clock::{format_call_duration, CallClock};
pub use engine::{EngineOptions, SessionEngine};
pub use session::SessionSnapshot;
pub use subscribers::Subscription;
