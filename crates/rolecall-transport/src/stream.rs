//! Persistent duplex channel over WebSocket.
//!
//! A supervisor task owns the socket. It connects with a bounded handshake,
//! pumps frames in both directions while connected, and on an abrupt drop
//! moves to `Degraded` and reconnects under [`ReconnectPolicy`] until the
//! attempt budget is spent. The budget is only restored by a connection
//! that proved stable. Callers see the channel only through
//! [`StreamEvent`]s, [`DuplexChannel::state`], and the send methods, which
//! fail fast with `NotConnected` instead of buffering.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rolecall_core::config::Config;
use rolecall_core::error::{Result, RoleCallError};
use rolecall_core::protocol::{stream_path, InboundFrame, StreamOutbound};
use rolecall_core::types::{AudioSegment, TransportState};

use crate::backoff::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StateChanged(TransportState),
    Frame(InboundFrame),
    /// A text frame that was not valid JSON. The channel stays open.
    Malformed { raw: String, error: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnect budget exhausted; the channel is now disconnected for good.
    ConnectionLost { attempts: u32 },
    /// Terminal close: by the caller (`code: None`) or by the server with a
    /// normal or policy close code.
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// `ws://` or `wss://` base, without trailing slash.
    pub ws_base: String,
    pub handshake_timeout: Duration,
    /// Ask the server to stream synthesized audio back.
    pub server_tts: bool,
    pub policy: ReconnectPolicy,
}

impl StreamOptions {
    pub fn from_config(config: &Config) -> Self {
        let stream = config.stream();
        Self {
            ws_base: config.server().resolve_ws_url(),
            handshake_timeout: config.handshake_timeout(),
            server_tts: stream.server_tts,
            policy: ReconnectPolicy::from_config(&stream.reconnect),
        }
    }

    pub fn url(&self, session_id: &str, role_id: &str) -> String {
        format!(
            "{}{}?enable_tts={}",
            self.ws_base,
            stream_path(session_id, role_id),
            self.server_tts
        )
    }
}

pub struct DuplexChannel {
    session_id: String,
    role_id: String,
    state_rx: watch::Receiver<TransportState>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DuplexChannel {
    /// Start connecting in the background. Returns immediately in the
    /// `Connecting` state; progress is reported on `events`.
    pub fn open(
        options: StreamOptions,
        session_id: &str,
        role_id: &str,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let url = options.url(session_id, role_id);
        info!(session_id, role_id, %url, "Opening duplex channel");

        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);
        let _ = events.send(StreamEvent::StateChanged(TransportState::Connecting));

        let outbound = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            url,
            options,
            state_tx,
            outbound: outbound.clone(),
            events,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            session_id: session_id.to_string(),
            role_id: role_id.to_string(),
            state_rx,
            outbound,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role_id(&self) -> &str {
        &self.role_id
    }

    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn state_watch(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    /// Send a user utterance as a `{"text": ...}` frame.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let payload = serde_json::to_string(&StreamOutbound {
            text: text.to_string(),
        })?;
        self.send(Message::Text(payload.into())).await
    }

    /// Send a captured segment as one binary frame.
    pub async fn send_audio(&self, segment: &AudioSegment) -> Result<()> {
        debug!(segment_id = %segment.id, bytes = segment.data.len(), "Sending audio segment");
        self.send(Message::Binary(segment.data.clone().into())).await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        if self.state() != TransportState::Connected {
            return Err(RoleCallError::NotConnected);
        }
        let guard = self.outbound.lock().await;
        let tx = guard.as_ref().ok_or(RoleCallError::NotConnected)?;
        tx.send(msg).map_err(|_| RoleCallError::NotConnected)
    }

    /// Stop the channel and wait for the socket to be released. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Duplex supervisor task failed");
            }
            info!(session_id = %self.session_id, role_id = %self.role_id, "Duplex channel closed");
        }
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How a connected session ended.
enum Exit {
    Cancelled,
    ClosedByServer { code: u16, reason: String },
    Dropped(String),
}

struct Supervisor {
    url: String,
    options: StreamOptions,
    state_tx: watch::Sender<TransportState>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let mut backoff = self.options.policy.backoff();

        loop {
            self.set_state(TransportState::Connecting);

            let handshake = tokio::time::timeout(
                self.options.handshake_timeout,
                connect_async(self.url.as_str()),
            );
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = handshake => result,
            };

            let reason = match result {
                Ok(Ok((ws, _response))) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.outbound.lock().await = Some(tx);
                    self.set_state(TransportState::Connected);
                    info!(url = %self.url, "Duplex channel connected");

                    let connected_at = Instant::now();
                    let (exit, heard_server) = self.pump(ws, rx).await;
                    *self.outbound.lock().await = None;

                    // A connection that drops before it is stable spends an
                    // attempt, so a flapping server still exhausts the budget.
                    if heard_server || connected_at.elapsed() >= self.options.policy.stable_after {
                        backoff.reset();
                    }

                    match exit {
                        Exit::Cancelled => break,
                        Exit::ClosedByServer { code, reason } => {
                            info!(code, %reason, "Server closed duplex channel");
                            self.set_state(TransportState::Disconnected);
                            let _ = self.events.send(StreamEvent::Closed {
                                code: Some(code),
                                reason,
                            });
                            return;
                        }
                        Exit::Dropped(reason) => reason,
                    }
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "handshake timed out after {:?}",
                    self.options.handshake_timeout
                ),
            };

            warn!(url = %self.url, %reason, "Duplex channel interrupted");

            let Some((attempt, delay)) = backoff.next_delay() else {
                let attempts = backoff.attempt();
                warn!(attempts, "Reconnect attempts exhausted");
                self.set_state(TransportState::Disconnected);
                let _ = self.events.send(StreamEvent::ConnectionLost { attempts });
                return;
            };

            self.set_state(TransportState::Degraded);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            let _ = self
                .events
                .send(StreamEvent::ReconnectScheduled { attempt, delay });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(TransportState::Disconnected);
        let _ = self.events.send(StreamEvent::Closed {
            code: None,
            reason: "closed by client".into(),
        });
    }

    /// Pump frames until the session ends. The flag reports whether the
    /// server sent any data frame.
    async fn pump(
        &self,
        ws: WsStream,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) -> (Exit, bool) {
        let (mut sink, mut source) = ws.split();
        let mut heard_server = false;

        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Exit::Cancelled;
                }
                Some(msg) = outbound.recv() => {
                    if let Err(e) = sink.send(msg).await {
                        break Exit::Dropped(e.to_string());
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        heard_server = true;
                        self.dispatch(text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        heard_server = true;
                        debug!(bytes = data.len(), "Ignoring inbound binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => break close_exit(frame),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Exit::Dropped(e.to_string()),
                    None => break Exit::Dropped("stream ended without close frame".into()),
                },
            }
        };
        (exit, heard_server)
    }

    fn dispatch(&self, text: &str) {
        match InboundFrame::decode(text) {
            Ok(frame) => {
                let _ = self.events.send(StreamEvent::Frame(frame));
            }
            Err(e) => {
                warn!(error = %e, "Malformed inbound frame");
                let _ = self.events.send(StreamEvent::Malformed {
                    raw: text.chars().take(200).collect(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn set_state(&self, state: TransportState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Duplex state changed");
            let _ = self.events.send(StreamEvent::StateChanged(state));
        }
    }
}

/// Normal and policy closes are final; anything else is treated as a drop.
fn close_exit(frame: Option<CloseFrame>) -> Exit {
    match frame {
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Policy) => {
            Exit::ClosedByServer {
                code: u16::from(frame.code),
                reason: frame.reason.to_string(),
            }
        }
        Some(frame) => Exit::Dropped(format!(
            "closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        )),
        None => Exit::Dropped("closed without status".into()),
    }
}
