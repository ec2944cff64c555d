//! Transport abstraction.
//!
//! Two delivery modes: one-shot request/response over HTTP ([`http`]) for
//! text chat and role listing, and a persistent duplex channel over
//! WebSocket ([`stream`]) for live voice turns. The [`ChatBackend`] trait is
//! the seam the session engine talks to for the one-shot half.

use async_trait::async_trait;

use rolecall_core::error::Result;
use rolecall_core::types::Role;

pub mod backoff;
pub mod http;
pub mod stream;

pub use backoff::{Backoff, ReconnectPolicy};
pub use http::HttpTransport;
pub use stream::{DuplexChannel, StreamEvent, StreamOptions};

/// One-shot request/response operations.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Fetch the role catalog. Not retried.
    async fn list_roles(&self) -> Result<Vec<Role>>;

    /// Ask the role for a reply to `message`. Not retried; safe to retry
    /// manually since it has no side effect beyond generating a reply.
    async fn request_reply(&self, role_id: &str, message: &str) -> Result<String>;
}
