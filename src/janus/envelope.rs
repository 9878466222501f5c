//! Janus wire envelopes: outbound requests, inbound frames, JSEP and
//! trickle candidates.
//!
//! Outbound requests are typed so that `session_id`/`handle_id` can never be
//! omitted where the gateway requires them. Inbound frames are parsed
//! leniently: unknown fields are ignored, unknown `janus` kinds map to
//! [`JanusKind::Unknown`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalError;

/// Plugin the session attaches to.
pub const VIDEOCALL_PLUGIN: &str = "janus.plugin.videocall";

/// Gateway-issued session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

/// Gateway-issued plugin handle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// JSEP + candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
        })
    }
}

/// Session description exchanged with the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
    pub candidate: String,
}

/// Payload of a `trickle` envelope: a candidate or the end-of-candidates
/// sentinel `{"completed": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCandidate", into = "RawCandidate")]
pub enum TrickleCandidate {
    Candidate(IceCandidateInit),
    Completed,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawCandidate {
    Candidate(IceCandidateInit),
    Completed { completed: bool },
}

impl TryFrom<RawCandidate> for TrickleCandidate {
    type Error = String;

    fn try_from(raw: RawCandidate) -> Result<Self, Self::Error> {
        match raw {
            RawCandidate::Candidate(c) => Ok(Self::Candidate(c)),
            RawCandidate::Completed { completed: true } => Ok(Self::Completed),
            RawCandidate::Completed { completed: false } => {
                Err("trickle candidate with completed=false".to_string())
            }
        }
    }
}

impl From<TrickleCandidate> for RawCandidate {
    fn from(c: TrickleCandidate) -> Self {
        match c {
            TrickleCandidate::Candidate(c) => RawCandidate::Candidate(c),
            TrickleCandidate::Completed => RawCandidate::Completed { completed: true },
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Optional media tweaks carried by a `set` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
}

/// Videocall plugin request, carried as the `body` of a `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum PluginRequest {
    Register { username: String },
    Call { username: String },
    Accept,
    Hangup,
    List,
    Set(CallSettings),
}

/// Top-level request envelope sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Request {
    Create {
        transaction: String,
    },
    Attach {
        session_id: SessionId,
        plugin: String,
        transaction: String,
    },
    Message {
        session_id: SessionId,
        handle_id: HandleId,
        transaction: String,
        body: PluginRequest,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
    },
    Trickle {
        session_id: SessionId,
        handle_id: HandleId,
        transaction: String,
        candidate: TrickleCandidate,
    },
    Keepalive {
        session_id: SessionId,
        transaction: String,
    },
    Detach {
        session_id: SessionId,
        handle_id: HandleId,
        transaction: String,
    },
    Destroy {
        session_id: SessionId,
        transaction: String,
    },
}

impl Request {
    pub fn to_text(&self) -> String {
        // Only maps, strings and integers in here: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JanusKind {
    Success,
    Ack,
    Error,
    Event,
    Webrtcup,
    Hangup,
    Detached,
    Media,
    Slowlink,
    Timeout,
    Trickle,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayErrorBody {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

/// Any frame received from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    pub janus: JanusKind,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub session_id: Option<u64>,
    /// Handle the frame originates from (events, webrtcup, hangup, ...).
    #[serde(default)]
    pub sender: Option<u64>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<GatewayErrorBody>,
    #[serde(default)]
    pub plugindata: Option<PluginData>,
    #[serde(default)]
    pub jsep: Option<Jsep>,
    #[serde(default)]
    pub candidate: Option<TrickleCandidate>,
    #[serde(default)]
    pub reason: Option<String>,
    /// `media` events: `"audio"` or `"video"`.
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub receiving: Option<bool>,
    /// `slowlink` events.
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub uplink: Option<bool>,
    #[serde(default)]
    pub lost: Option<u64>,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, SignalError> {
        serde_json::from_str(text).map_err(|e| SignalError::ProtocolParse(e.to_string()))
    }

    /// `data.id` of a create/attach success.
    pub fn data_id(&self) -> Option<u64> {
        self.data.as_ref()?.get("id")?.as_u64()
    }
}

// ---------------------------------------------------------------------------
// Videocall plugin events
// ---------------------------------------------------------------------------

/// Event reported by the videocall plugin under `plugindata.data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Registered { username: String },
    Calling,
    IncomingCall { username: String },
    Accepted { username: Option<String> },
    Hangup { username: Option<String>, reason: Option<String> },
    Update,
    /// Reply to a `list` request.
    List(Vec<String>),
    Error { code: i64, reason: String },
    Other(String),
}

#[derive(Debug, Default, Deserialize)]
struct VideocallData {
    #[serde(default)]
    result: Option<VideocallResult>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideocallResult {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    list: Option<Vec<String>>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

impl PluginEvent {
    /// Interpret `plugindata.data`. Returns `None` when the payload carries
    /// neither a result nor an error.
    pub fn from_data(data: &Value) -> Option<Self> {
        let data: VideocallData = serde_json::from_value(data.clone()).ok()?;

        if let Some(code) = data.error_code {
            return Some(Self::Error {
                code,
                reason: data.error.unwrap_or_default(),
            });
        }

        let result = data.result?;
        let event = match result.event.as_deref() {
            Some(event) => event,
            None => return result.list.map(Self::List),
        };

        Some(match event {
            "registered" => Self::Registered {
                username: result.username.unwrap_or_default(),
            },
            "calling" => Self::Calling,
            "incomingcall" => Self::IncomingCall {
                username: result.username.unwrap_or_default(),
            },
            "accepted" => Self::Accepted {
                username: result.username,
            },
            "hangup" => Self::Hangup {
                username: result.username,
                reason: result.reason,
            },
            "update" => Self::Update,
            "error" => Self::Error {
                code: result.error_code.unwrap_or_default(),
                reason: result.error.unwrap_or_default(),
            },
            other => Self::Other(other.to_string()),
        })
    }
}
