//! Events delivered to whoever drives the client (CLI, UI).

use std::fmt;

use crate::calling::engine::{MediaKind, PeerConnectionState};
use crate::error::SignalError;
use crate::janus::envelope::{HandleId, SessionId};

/// Why a call attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEndReason {
    LocalHangup,
    /// We declined the incoming call.
    Rejected,
    RemoteHangup(Option<String>),
    Failed(SignalError),
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("hung up"),
            Self::Rejected => f.write_str("rejected"),
            Self::RemoteHangup(Some(reason)) => write!(f, "remote hangup: {}", reason),
            Self::RemoteHangup(None) => f.write_str("remote hangup"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Session created and plugin attached.
    Connected {
        session_id: SessionId,
        handle_id: HandleId,
    },
    /// Session over; `None` after an orderly shutdown.
    Disconnected { error: Option<SignalError> },
    Registered { username: String },
    IncomingCall { peer: String },
    CallAccepted { peer: String },
    /// Media path is up (`webrtcup`).
    CallEstablished { peer: String },
    CallEnded {
        peer: Option<String>,
        reason: CallEndReason,
    },
    LocalStream,
    RemoteStream { kind: MediaKind },
    ConnectionState(PeerConnectionState),
    Peers(Vec<String>),
    MediaState { medium: Option<String>, receiving: bool },
    SlowLink {
        medium: Option<String>,
        uplink: bool,
        lost: u64,
    },
    Error { kind: &'static str, detail: String },
}

impl ClientEvent {
    pub fn error(e: &SignalError) -> Self {
        Self::Error {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected {
                session_id,
                handle_id,
            } => write!(f, "connected (session {}, handle {})", session_id, handle_id),
            Self::Disconnected { error: None } => f.write_str("disconnected"),
            Self::Disconnected { error: Some(e) } => write!(f, "disconnected: {}", e),
            Self::Registered { username } => write!(f, "registered as {}", username),
            Self::IncomingCall { peer } => write!(f, "incoming call from {}", peer),
            Self::CallAccepted { peer } => write!(f, "call accepted by {}", peer),
            Self::CallEstablished { peer } => write!(f, "media established with {}", peer),
            Self::CallEnded { peer, reason } => match peer {
                Some(p) => write!(f, "call with {} ended: {}", p, reason),
                None => write!(f, "call ended: {}", reason),
            },
            Self::LocalStream => f.write_str("local stream ready"),
            Self::RemoteStream { kind } => write!(f, "remote {} track", kind),
            Self::ConnectionState(s) => write!(f, "ICE {}", s),
            Self::Peers(list) if list.is_empty() => f.write_str("no registered peers"),
            Self::Peers(list) => write!(f, "peers: {}", list.join(", ")),
            Self::MediaState { medium, receiving } => write!(
                f,
                "{} {}",
                medium.as_deref().unwrap_or("media"),
                if *receiving { "flowing" } else { "stopped" }
            ),
            Self::SlowLink {
                medium,
                uplink,
                lost,
            } => write!(
                f,
                "slow {} {} link ({} lost)",
                medium.as_deref().unwrap_or("media"),
                if *uplink { "up" } else { "down" },
                lost
            ),
            Self::Error { kind, detail } => write!(f, "{}: {}", kind, detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_event_uses_taxonomy_name() {
        let ev = ClientEvent::error(&SignalError::GatewayTimeout);
        assert!(matches!(ev, ClientEvent::Error { kind: "GatewayTimeout", .. }));
    }

    #[test]
    fn test_display_call_end() {
        let ev = ClientEvent::CallEnded {
            peer: Some("dave".into()),
            reason: CallEndReason::Failed(SignalError::PeerUnavailable("User not found".into())),
        };
        assert_eq!(
            ev.to_string(),
            "call with dave ended: failed: peer unavailable: User not found"
        );
    }
}
