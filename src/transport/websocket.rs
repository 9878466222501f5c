//! Janus WebSocket connection and frame handling

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Transport, TransportEvent, TransportState, CLOSE_ABNORMAL, CLOSE_IDLE_TIMEOUT};
use crate::error::SignalError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Default idle interval before the liveness probe fires.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(20);

pub struct JanusSocket {
    stream: Option<WsStream>,
    state: TransportState,
    idle_interval: Duration,
    last_rx: Instant,
    /// A ping is out and nothing has been received since.
    probing: bool,
    /// Ping/pong frames not yet fully written. A frame leaves the queue only
    /// once sent, so a `next_event` dropped mid-write retries it next time.
    control: VecDeque<Message>,
    opened_pending: bool,
    close_pending: Option<TransportEvent>,
}

impl JanusSocket {
    /// Open a WebSocket to the gateway, offering `subprotocol`.
    ///
    /// Every failure before the handshake completes (bad URI, DNS, TCP, TLS,
    /// HTTP upgrade, or `connect_timeout` elapsing) is `TransportUnreachable`.
    pub async fn connect(
        uri: &str,
        subprotocol: &str,
        connect_timeout: Duration,
        idle_interval: Duration,
    ) -> Result<Self, SignalError> {
        let mut request = uri
            .into_client_request()
            .map_err(|e| SignalError::TransportUnreachable(format!("{}: {}", uri, e)))?;
        let protocol = HeaderValue::from_str(subprotocol)
            .map_err(|e| SignalError::TransportUnreachable(format!("bad subprotocol: {}", e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol);

        tracing::info!("Connecting WebSocket to {}", uri);

        let (stream, response) = match tokio::time::timeout(connect_timeout, connect_async(request)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(SignalError::TransportUnreachable(format!("{}: {}", uri, e)));
            }
            Err(_) => {
                return Err(SignalError::TransportUnreachable(format!(
                    "{}: no handshake within {:?}",
                    uri, connect_timeout
                )));
            }
        };

        tracing::info!(
            "WebSocket connected (status={}, protocol={:?})",
            response.status(),
            response.headers().get("sec-websocket-protocol")
        );

        Ok(Self {
            stream: Some(stream),
            state: TransportState::Open,
            idle_interval,
            last_rx: Instant::now(),
            probing: false,
            control: VecDeque::new(),
            opened_pending: true,
            close_pending: None,
        })
    }

    /// Drop the stream and remember the `Closed` event to deliver.
    fn finish(&mut self, code: u16, reason: impl Into<String>, remote: bool) {
        self.stream = None;
        self.state = TransportState::Closed;
        if self.close_pending.is_none() {
            self.close_pending = Some(TransportEvent::Closed {
                code,
                reason: reason.into(),
                remote,
            });
        }
    }

}

async fn send_close_frame(stream: &mut WsStream, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = stream.close(Some(frame)).await {
        tracing::debug!("Close frame not delivered: {}", e);
    }
}

#[async_trait]
impl Transport for JanusSocket {
    fn state(&self) -> TransportState {
        self.state
    }

    async fn send(&mut self, text: &str) -> Result<(), SignalError> {
        let stream = match (self.state, self.stream.as_mut()) {
            (TransportState::Open, Some(stream)) => stream,
            _ => return Err(SignalError::TransportNotOpen),
        };
        tracing::debug!("WS send: {}", text);
        if let Err(e) = stream.send(Message::Text(text.to_string())).await {
            tracing::warn!("WebSocket send failed: {}", e);
            let reason = e.to_string();
            self.finish(CLOSE_ABNORMAL, reason.clone(), true);
            return Err(SignalError::TransportClosedUnexpectedly {
                code: CLOSE_ABNORMAL,
                reason,
            });
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.opened_pending {
            self.opened_pending = false;
            return Some(TransportEvent::Opened);
        }
        if let Some(event) = self.close_pending.take() {
            return Some(event);
        }

        loop {
            let stream = self.stream.as_mut()?;

            while let Some(frame) = self.control.front().cloned() {
                let is_ping = matches!(frame, Message::Ping(_));
                if let Err(e) = stream.send(frame).await {
                    tracing::warn!("Failed to send control frame: {}", e);
                    self.finish(CLOSE_ABNORMAL, e.to_string(), true);
                    return self.close_pending.take();
                }
                self.control.pop_front();
                if is_ping {
                    // The probe gets a full interval from when it actually left.
                    self.last_rx = Instant::now();
                }
            }

            let deadline = self.last_rx + self.idle_interval;
            let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(frame) => frame,
                Err(_) if !self.probing => {
                    tracing::debug!("No traffic for {:?}, probing", self.idle_interval);
                    self.probing = true;
                    self.control.push_back(Message::Ping(Vec::new()));
                    continue;
                }
                Err(_) => {
                    tracing::warn!("Liveness probe unanswered, closing");
                    // Settle the state before awaiting anything; the close
                    // handshake finishes on its own.
                    if let Some(mut stream) = self.stream.take() {
                        tokio::spawn(async move {
                            send_close_frame(&mut stream, CLOSE_IDLE_TIMEOUT, "idle timeout").await;
                        });
                    }
                    self.finish(CLOSE_IDLE_TIMEOUT, "idle timeout", false);
                    return self.close_pending.take();
                }
            };

            self.last_rx = Instant::now();
            self.probing = false;

            match frame {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Some(TransportEvent::Message(text));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(TransportEvent::Message(text)),
                    Err(e) => {
                        return Some(TransportEvent::Error {
                            kind: "ProtocolParseError",
                            detail: format!("binary frame is not UTF-8: {}", e),
                        });
                    }
                },
                Some(Ok(Message::Ping(data))) => self.control.push_back(Message::Pong(data)),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed by gateway: {:?}", frame);
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    self.finish(code, reason, true);
                    return self.close_pending.take();
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    tracing::warn!("WebSocket receive error: {}", e);
                    self.finish(CLOSE_ABNORMAL, e.to_string(), true);
                    return Some(TransportEvent::Error {
                        kind: "TransportClosedUnexpectedly",
                        detail: e.to_string(),
                    });
                }
                None => {
                    self.finish(CLOSE_ABNORMAL, "connection reset", true);
                    return self.close_pending.take();
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.state != TransportState::Open {
            return;
        }
        tracing::info!("Closing WebSocket ({}: {})", code, reason);
        self.state = TransportState::Closing;
        if let Some(stream) = self.stream.as_mut() {
            send_close_frame(stream, code, reason).await;
        }
        self.finish(code, reason, false);
    }
}
