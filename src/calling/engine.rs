//! Capability set the negotiation controller needs from a WebRTC engine.
//!
//! Engines report asynchronous happenings (local candidates, tracks,
//! connection state) through the channel handed to [`MediaEngine::subscribe`];
//! the client loop drains that channel next to transport events.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::janus::envelope::{IceCandidateInit, Jsep, TrickleCandidate};

/// Public STUN server used when nothing else is configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// One entry of the `ice_servers` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn default_servers() -> Vec<Self> {
        vec![Self::new(DEFAULT_STUN_URL)]
    }
}

/// `OfferToReceiveAudio` / `OfferToReceiveVideo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Local camera/microphone capture parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub prefer_front_camera: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            prefer_front_camera: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// ICE connection state of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = format!("{:?}", self);
        f.write_str(&s.to_lowercase())
    }
}

/// Callback-style notifications from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidateInit),
    GatheringComplete,
    /// Local capture is running and attached to the peer connection.
    LocalStream,
    RemoteTrack(MediaKind),
    ConnectionState(PeerConnectionState),
}

#[async_trait]
pub trait MediaEngine: Send {
    /// Install the sink for [`EngineEvent`]s. Called once, before any other method.
    fn subscribe(&mut self, events: mpsc::UnboundedSender<EngineEvent>);

    async fn create_peer_connection(&mut self, ice_servers: &[IceServer]) -> Result<()>;

    async fn start_local_capture(&mut self, settings: &CaptureSettings) -> Result<()>;

    async fn create_offer(&mut self, constraints: &MediaConstraints) -> Result<Jsep>;

    async fn create_answer(&mut self, constraints: &MediaConstraints) -> Result<Jsep>;

    async fn set_local_description(&mut self, jsep: &Jsep) -> Result<()>;

    async fn set_remote_description(&mut self, jsep: &Jsep) -> Result<()>;

    /// Apply a remote candidate, or end-of-candidates for `Completed`.
    async fn add_ice_candidate(&mut self, candidate: &TrickleCandidate) -> Result<()>;

    /// Release the peer connection, capturer, surface helper and local
    /// stream, in that order. Idempotent.
    async fn close(&mut self);
}
