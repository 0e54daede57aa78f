//! Jetstream websocket connector.
//!
//! The connector owns the pipeline for the lifetime of the task and runs a
//! small state machine until cancelled:
//!
//! ```text
//! Disconnected → Connecting ──ok──→ Connected ──idle timeout──→ Connected
//!                    │                  │
//!                    │ error            │ closed / error
//!                    ▼                  ▼
//!                 Backoff(class) ←──────┘
//!                    │
//!                    └──delay──→ Connecting
//! ```
//!
//! A closed connection backs off for the short delay, anything else for the
//! long one. Cancellation is observed while connecting, while waiting for a
//! frame and while backing off. A flush triggered by a frame always runs to
//! completion before the next receive.

use super::SourceStats;
use crate::pipeline::MentionPipeline;
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use std::future::Future;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Connector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Backoff => 3.0,
        }
    }
}

/// Why a connection attempt or session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The peer closed or reset the connection.
    Closed,
    /// Anything else.
    Error,
}

impl FailureClass {
    /// Classify a pipeline error raised by a dialer or session.
    pub fn of(err: &Error) -> Self {
        match err {
            Error::WebSocket(e) => match e.as_ref() {
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(
                    tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
                ) => Self::Closed,
                tungstenite::Error::Io(io) => Self::of_io(io),
                _ => Self::Error,
            },
            Error::Io(io) => Self::of_io(io),
            _ => Self::Error,
        }
    }

    fn of_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

/// Fixed reconnect delays keyed by failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub closed: Duration,
    pub error: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            closed: Duration::from_secs(5),
            error: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, class: FailureClass) -> Duration {
        match class {
            FailureClass::Closed => self.closed,
            FailureClass::Error => self.error,
        }
    }
}

/// A received frame, reduced to what the connector cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text or binary payload.
    Payload(Bytes),
    /// Ping, pong or raw frame; nothing to do.
    Control,
    /// Close frame from the server.
    Close,
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Payload(Bytes::copy_from_slice(text.as_bytes())),
            Message::Binary(data) => Frame::Payload(data),
            Message::Close(_) => Frame::Close,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
        }
    }
}

/// Opens sessions. The live implementation is [`WebSocketDialer`]; tests
/// script their own.
pub trait Dialer: Send {
    type Session: Stream<Item = Result<Frame>> + Unpin + Send;

    fn dial(&mut self) -> impl Future<Output = Result<Self::Session>> + Send;

    /// Where this dialer connects, for logs.
    fn describe(&self) -> String;
}

/// Dials the Jetstream websocket with `wantedCollections` set.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: Url,
}

impl WebSocketDialer {
    /// Build the subscribe URL from `endpoint` and `collection`.
    ///
    /// An endpoint that already carries `wantedCollections` is used as is.
    pub fn new(endpoint: &str, collection: &str) -> Result<Self> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?;

        if !url.query_pairs().any(|(key, _)| key == "wantedCollections") {
            url.query_pairs_mut()
                .append_pair("wantedCollections", collection);
        }

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Dialer for WebSocketDialer {
    type Session = BoxStream<'static, Result<Frame>>;

    async fn dial(&mut self) -> Result<Self::Session> {
        let (ws, response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        debug!("Websocket handshake completed: HTTP {}", response.status());

        Ok(ws
            .map(|message| message.map(Frame::from).map_err(Error::from))
            .boxed())
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// How a connected session ended.
enum SessionEnd {
    Cancelled,
    Failed(FailureClass, String),
}

/// Live firehose connector.
pub struct JetstreamConnector<D: Dialer> {
    dialer: D,
    policy: BackoffPolicy,
    idle_timeout: Duration,
    connect_timeout: Duration,
    state: ConnectionState,
    stats: SourceStats,
}

impl<D: Dialer> JetstreamConnector<D> {
    pub fn new(dialer: D, policy: BackoffPolicy, idle_timeout: Duration) -> Self {
        Self {
            dialer,
            policy,
            idle_timeout,
            connect_timeout: Duration::from_secs(30),
            state: ConnectionState::Disconnected,
            stats: SourceStats::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Connect, receive and reconnect until `cancel` fires.
    pub async fn run(
        &mut self,
        pipeline: &mut MentionPipeline,
        cancel: &CancellationToken,
    ) -> SourceStats {
        info!("Connecting to Jetstream at {}", self.dialer.describe());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.transition(ConnectionState::Connecting);
            let dialed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                dialed = tokio::time::timeout(self.connect_timeout, self.dialer.dial()) => dialed,
            };

            let (class, reason) = match dialed {
                Ok(Ok(session)) => {
                    self.stats.connects += 1;
                    counter!("stream_connects_total").increment(1);
                    self.transition(ConnectionState::Connected);
                    info!("Connected. Listening for posts...");

                    match self.receive(session, pipeline, cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(class, reason) => (class, reason),
                    }
                }
                Ok(Err(e)) => (FailureClass::of(&e), e.to_string()),
                Err(_) => (
                    FailureClass::Error,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ),
            };

            match class {
                FailureClass::Closed => self.stats.closed_failures += 1,
                FailureClass::Error => self.stats.error_failures += 1,
            }
            counter!("stream_failures_total", "class" => class.as_str()).increment(1);

            let delay = self.policy.delay_for(class);
            self.transition(ConnectionState::Backoff);
            warn!(
                "Connection {} ({}). Retrying in {}s...",
                class.as_str(),
                reason,
                delay.as_secs_f64()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(ConnectionState::Disconnected);
        info!("Connector stopped");
        self.stats.clone()
    }

    async fn receive(
        &mut self,
        mut session: D::Session,
        pipeline: &mut MentionPipeline,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                next = tokio::time::timeout(self.idle_timeout, session.next()) => next,
            };

            match next {
                Err(_) => {
                    self.stats.idle_timeouts += 1;
                    counter!("stream_idle_timeouts_total").increment(1);
                }
                Ok(Some(Ok(Frame::Payload(payload)))) => {
                    self.stats.frames += 1;
                    pipeline.handle_frame(&payload).await;
                }
                Ok(Some(Ok(Frame::Control))) => {}
                Ok(Some(Ok(Frame::Close))) => {
                    return SessionEnd::Failed(
                        FailureClass::Closed,
                        "close frame received".to_string(),
                    );
                }
                Ok(Some(Err(e))) => return SessionEnd::Failed(FailureClass::of(&e), e.to_string()),
                Ok(None) => {
                    return SessionEnd::Failed(FailureClass::Closed, "stream ended".to_string());
                }
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection state: {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
        gauge!("stream_connection_state").set(next.gauge_value());
    }
}
