//! Gateway transport: the `Transport` seam and its WebSocket implementation.

pub mod websocket;

use std::fmt;

use async_trait::async_trait;

use crate::error::SignalError;

pub use websocket::JanusSocket;

/// WebSocket sub-protocol spoken by the Janus gateway.
pub const SUBPROTOCOL: &str = "janus-protocol";

/// Orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Local close after the liveness probe went unanswered.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Closed {
        code: u16,
        reason: String,
        remote: bool,
    },
    /// Non-fatal problem worth surfacing (a `Closed` follows if it was fatal).
    Error { kind: &'static str, detail: String },
}

/// Bidirectional text-frame channel to the gateway.
///
/// `next_event` must be cancel-safe: the client loop polls it inside
/// `tokio::select!` next to timers and commands.
#[async_trait]
pub trait Transport: Send {
    fn state(&self) -> TransportState;

    /// Queue one text frame. Fails with `TransportNotOpen` unless OPEN.
    async fn send(&mut self, text: &str) -> Result<(), SignalError>;

    /// Next lifecycle or message event. `None` once `Closed` was delivered.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Idempotent. The resulting `Closed` event is still delivered once.
    async fn close(&mut self, code: u16, reason: &str);
}
