//! Error taxonomy shared by the transport, session and negotiation layers.

use std::fmt;

use thiserror::Error;

/// Step of the SDP negotiation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    PeerConnection,
    LocalCapture,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PeerConnection => "peer connection setup",
            Self::LocalCapture => "local capture",
            Self::CreateOffer => "createOffer",
            Self::CreateAnswer => "createAnswer",
            Self::SetLocalDescription => "setLocalDescription",
            Self::SetRemoteDescription => "setRemoteDescription",
        };
        f.write_str(name)
    }
}

/// Everything that can go wrong between the UI and the gateway.
///
/// Cloneable so a single failure can resolve a pending transaction and be
/// reported upward at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("gateway unreachable: {0}")]
    TransportUnreachable(String),

    #[error("transport is not open")]
    TransportNotOpen,

    #[error("transport closed unexpectedly (code {code}): {reason}")]
    TransportClosedUnexpectedly { code: u16, reason: String },

    #[error("malformed gateway frame: {0}")]
    ProtocolParse(String),

    #[error("gateway error {code}: {reason}")]
    Gateway { code: i64, reason: String },

    #[error("gateway did not answer before the transaction deadline")]
    GatewayTimeout,

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("registration rejected: {0}")]
    NotRegistered(String),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("media negotiation failed during {stage}: {detail}")]
    MediaNegotiationFailed {
        stage: NegotiationStage,
        detail: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("cannot {action} while {from}")]
    InvalidState { from: String, action: &'static str },
}

impl SignalError {
    /// Stable taxonomy name, used as the `kind` of upward error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransportUnreachable(_) => "TransportUnreachable",
            Self::TransportNotOpen => "TransportNotOpen",
            Self::TransportClosedUnexpectedly { .. } => "TransportClosedUnexpectedly",
            Self::ProtocolParse(_) => "ProtocolParseError",
            Self::Gateway { .. } => "GatewayError",
            Self::GatewayTimeout => "GatewayTimeout",
            Self::SessionLost(_) => "SessionLost",
            Self::NotRegistered(_) => "NotRegistered",
            Self::PeerUnavailable(_) => "PeerUnavailable",
            Self::MediaNegotiationFailed { .. } => "MediaNegotiationFailed",
            Self::Cancelled => "Cancelled",
            Self::InvalidState { .. } => "InvalidState",
        }
    }

    pub(crate) fn invalid_state(from: impl fmt::Display, action: &'static str) -> Self {
        Self::InvalidState {
            from: from.to_string(),
            action,
        }
    }

    pub(crate) fn media(stage: NegotiationStage, err: &anyhow::Error) -> Self {
        Self::MediaNegotiationFailed {
            stage,
            detail: format!("{:#}", err),
        }
    }
}
