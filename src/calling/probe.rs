//! Signaling-only media engine.
//!
//! Produces real SDP and real ICE candidates (host, plus server-reflexive
//! via the configured STUN servers) but carries no audio or video. It lets
//! the CLI drive a complete call through a gateway without a WebRTC stack.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::engine::{
    CaptureSettings, EngineEvent, IceServer, MediaConstraints, MediaEngine, MediaKind,
    PeerConnectionState,
};
use super::ice::{gather_host_candidate, parse_candidate};
use super::media::{MediaResources, Resource};
use super::sdp::{self, LocalParams, SdpSummary};
use super::stun;
use crate::janus::envelope::{Jsep, SdpType, TrickleCandidate};

pub struct ProbeEngine {
    h264_high_profile: bool,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    ice_servers: Vec<IceServer>,
    socket: Option<Arc<UdpSocket>>,
    local: Option<LocalParams>,
    capture: Option<CaptureSettings>,
    local_description: Option<Jsep>,
    remote: Option<SdpSummary>,
    remote_type: Option<SdpType>,
    remote_candidates: Vec<String>,
    gatherer: Option<JoinHandle<()>>,
    resources: MediaResources,
}

impl ProbeEngine {
    pub fn new(h264_high_profile: bool) -> Self {
        Self {
            h264_high_profile,
            events: None,
            ice_servers: Vec::new(),
            socket: None,
            local: None,
            capture: None,
            local_description: None,
            remote: None,
            remote_type: None,
            remote_candidates: Vec::new(),
            gatherer: None,
            resources: MediaResources::new(),
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn local_params(&self) -> Result<&LocalParams> {
        match &self.local {
            Some(p) if self.resources.holds(Resource::PeerConnection) => Ok(p),
            _ => bail!("no peer connection"),
        }
    }

    /// Gather host and server-reflexive candidates in the background.
    fn start_gathering(&mut self) -> Result<()> {
        let socket = match &self.socket {
            Some(s) => s.clone(),
            None => bail!("no peer connection"),
        };
        let events = self.events.clone();
        let stun_servers: Vec<String> = self
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.iter())
            .filter_map(|u| stun::stun_host(u))
            .collect();

        if let Some(old) = self.gatherer.take() {
            old.abort();
        }
        self.gatherer = Some(tokio::spawn(async move {
            let send = |event: EngineEvent| {
                if let Some(tx) = &events {
                    let _ = tx.send(event);
                }
            };

            match socket.local_addr().ok().and_then(gather_host_candidate) {
                Some(host) => send(EngineEvent::LocalCandidate(host.to_init())),
                None => tracing::warn!("No host candidate available"),
            }
            for server in stun_servers {
                match stun::gather_srflx_candidate(&socket, &server).await {
                    Ok(srflx) => send(EngineEvent::LocalCandidate(srflx.to_init())),
                    Err(e) => tracing::warn!("STUN {} failed: {:#}", server, e),
                }
            }
            send(EngineEvent::GatheringComplete);
        }));
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for ProbeEngine {
    fn subscribe(&mut self, events: mpsc::UnboundedSender<EngineEvent>) {
        self.events = Some(events);
    }

    async fn create_peer_connection(&mut self, ice_servers: &[IceServer]) -> Result<()> {
        if self.resources.holds(Resource::PeerConnection) {
            return Ok(());
        }
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind ICE socket")?;
        tracing::info!(
            "Peer connection created (udp {})",
            socket.local_addr().context("ICE socket has no address")?
        );
        self.socket = Some(Arc::new(socket));
        self.local = Some(LocalParams::generate(self.h264_high_profile)?);
        self.ice_servers = ice_servers.to_vec();
        self.local_description = None;
        self.remote = None;
        self.remote_type = None;
        self.remote_candidates.clear();
        self.resources.acquire(Resource::PeerConnection);
        self.emit(EngineEvent::ConnectionState(PeerConnectionState::New));
        Ok(())
    }

    async fn start_local_capture(&mut self, settings: &CaptureSettings) -> Result<()> {
        self.local_params()?;
        tracing::info!(
            "Local capture {}x{}@{} ({} camera, synthetic)",
            settings.width,
            settings.height,
            settings.fps,
            if settings.prefer_front_camera {
                "front"
            } else {
                "back"
            }
        );
        self.capture = Some(settings.clone());
        self.resources.acquire(Resource::SurfaceHelper);
        self.resources.acquire(Resource::Capturer);
        self.resources.acquire(Resource::LocalStream);
        self.emit(EngineEvent::LocalStream);
        Ok(())
    }

    async fn create_offer(&mut self, constraints: &MediaConstraints) -> Result<Jsep> {
        let local = self.local_params()?;
        Ok(Jsep::offer(sdp::generate_offer(local, constraints)))
    }

    async fn create_answer(&mut self, _constraints: &MediaConstraints) -> Result<Jsep> {
        let local = self.local_params()?;
        let remote = match (&self.remote, self.remote_type) {
            (Some(remote), Some(SdpType::Offer)) => remote,
            _ => bail!("no remote offer to answer"),
        };
        Ok(Jsep::answer(sdp::generate_answer(local, remote)?))
    }

    async fn set_local_description(&mut self, jsep: &Jsep) -> Result<()> {
        self.local_params()?;
        sdp::parse_summary(&jsep.sdp).context("invalid local description")?;
        self.local_description = Some(jsep.clone());
        self.start_gathering()
    }

    async fn set_remote_description(&mut self, jsep: &Jsep) -> Result<()> {
        self.local_params()?;
        let summary = sdp::parse_summary(&jsep.sdp).context("invalid remote description")?;
        tracing::info!(
            "Remote {}: {} section(s), {} candidate(s)",
            jsep.kind,
            summary.sections.len(),
            summary.candidates.len()
        );
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if summary.has(kind) {
                self.emit(EngineEvent::RemoteTrack(kind));
            }
        }
        self.remote_candidates.extend(summary.candidates.iter().cloned());
        self.remote = Some(summary);
        self.remote_type = Some(jsep.kind);
        self.emit(EngineEvent::ConnectionState(PeerConnectionState::Checking));
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &TrickleCandidate) -> Result<()> {
        if self.remote.is_none() {
            bail!("remote description not set");
        }
        match candidate {
            TrickleCandidate::Candidate(init) => {
                let parsed = parse_candidate(&init.candidate)?;
                tracing::debug!(
                    "Remote candidate {}:{} ({:?}, mid {})",
                    parsed.address,
                    parsed.port,
                    parsed.candidate_type,
                    init.sdp_mid
                );
                self.remote_candidates.push(init.candidate.clone());
            }
            TrickleCandidate::Completed => {
                tracing::debug!(
                    "Remote gathering complete ({} candidates)",
                    self.remote_candidates.len()
                );
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.gatherer.take() {
            task.abort();
        }
        let released = self.resources.release();
        if released.is_empty() {
            return;
        }
        for resource in &released {
            match resource {
                Resource::PeerConnection => {
                    self.socket = None;
                    self.local_description = None;
                    self.remote = None;
                    self.remote_type = None;
                    self.remote_candidates.clear();
                }
                Resource::Capturer => self.capture = None,
                Resource::SurfaceHelper | Resource::LocalStream => {}
            }
        }
        tracing::info!("Media released ({} resources)", released.len());
        self.emit(EngineEvent::ConnectionState(PeerConnectionState::Closed));
    }
}

impl Drop for ProbeEngine {
    fn drop(&mut self) {
        if let Some(task) = self.gatherer.take() {
            task.abort();
        }
    }
}
