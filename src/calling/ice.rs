//! ICE candidates: SDP `candidate:` lines, host gathering, and the trickle
//! buffers that keep candidates behind their session descriptions.

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context, Result};

use crate::janus::envelope::{IceCandidateInit, TrickleCandidate};

// ---------------------------------------------------------------------------
// Candidate lines
// ---------------------------------------------------------------------------

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

/// ICE transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Parsed ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub protocol: Protocol,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// For srflx/prflx/relay: the related address.
    pub raddr: Option<String>,
    pub rport: Option<u16>,
}

impl IceCandidate {
    /// Format as a `candidate:` attribute value (no `a=` prefix).
    pub fn to_sdp_line(&self) -> String {
        let protocol = match self.protocol {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        };
        let typ = match self.candidate_type {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation, self.component, protocol, self.priority, self.address, self.port, typ
        );
        if let (Some(ra), Some(rp)) = (&self.raddr, self.rport) {
            line.push_str(&format!(" raddr {} rport {}", ra, rp));
        }
        line
    }

    /// Wrap for the trickle wire shape, bundled on the first m-line.
    pub fn to_init(&self) -> IceCandidateInit {
        IceCandidateInit {
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            candidate: self.to_sdp_line(),
        }
    }
}

/// Parse an `a=candidate:` / `candidate:` line.
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let content = line
        .strip_prefix("a=candidate:")
        .or_else(|| line.strip_prefix("candidate:"));
    let content = match content {
        Some(c) => c,
        None => bail!("not a candidate line: {}", line),
    };

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }

    let foundation = parts[0].to_string();
    let component: u8 = parts[1].parse().context("bad component")?;

    let protocol = match parts[2].to_ascii_lowercase().as_str() {
        "udp" => Protocol::Udp,
        "tcp" => Protocol::Tcp,
        other => bail!("unsupported transport: {}", other),
    };

    let priority: u32 = parts[3].parse().context("bad priority")?;
    let address = parts[4].to_string();
    let port: u16 = parts[5].parse().context("bad port")?;

    if parts[6] != "typ" {
        bail!("expected 'typ' keyword at position 6, got: {}", parts[6]);
    }

    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    let mut raddr = None;
    let mut rport = None;
    let mut i = 8;
    while i < parts.len() {
        match parts[i] {
            "raddr" if i + 1 < parts.len() => {
                raddr = Some(parts[i + 1].to_string());
                i += 2;
            }
            "rport" if i + 1 < parts.len() => {
                rport = Some(parts[i + 1].parse().context("bad rport")?);
                i += 2;
            }
            // generation, ufrag, network-id, tcptype ...
            _ => i += 1,
        }
    }

    Ok(IceCandidate {
        foundation,
        component,
        protocol,
        priority,
        address,
        port,
        candidate_type,
        raddr,
        rport,
    })
}

/// ICE candidate priority per RFC 8445 section 5.1.2.1.
pub fn compute_priority(ctype: CandidateType, local_preference: u16, component: u8) -> u32 {
    let type_preference: u32 = match ctype {
        CandidateType::Host => 126,
        CandidateType::PeerReflexive => 110,
        CandidateType::ServerReflexive => 100,
        CandidateType::Relay => 0,
    };
    (type_preference << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// Host candidate for a socket bound to `local_addr`.
///
/// For a wildcard bind, the outbound interface address is found with the
/// connect-a-UDP-socket trick (no packet is sent).
pub fn gather_host_candidate(local_addr: SocketAddr) -> Option<IceCandidate> {
    let ip: IpAddr = if local_addr.ip().is_unspecified() {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        socket.local_addr().ok()?.ip()
    } else {
        local_addr.ip()
    };

    Some(IceCandidate {
        foundation: "1".into(),
        component: 1,
        protocol: Protocol::Udp,
        priority: compute_priority(CandidateType::Host, 65535, 1),
        address: ip.to_string(),
        port: local_addr.port(),
        candidate_type: CandidateType::Host,
        raddr: None,
        rport: None,
    })
}

// ---------------------------------------------------------------------------
// Trickle buffering
// ---------------------------------------------------------------------------

/// Holds candidates until the description they belong to is in place.
///
/// Outbound: nothing goes to the gateway before the local description is
/// set, and the end-of-candidates sentinel goes out once.
/// Inbound: nothing reaches the engine before the remote description is
/// set; early candidates are released once, in arrival order.
#[derive(Debug, Default)]
pub struct IceBuffer {
    local_ready: bool,
    remote_ready: bool,
    local: Vec<TrickleCandidate>,
    remote: Vec<TrickleCandidate>,
    completed_seen: bool,
}

impl IceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local candidate from the engine. Returns what may be trickled now.
    pub fn push_local(&mut self, candidate: TrickleCandidate) -> Vec<TrickleCandidate> {
        if candidate == TrickleCandidate::Completed {
            if self.completed_seen {
                tracing::debug!("Duplicate end-of-candidates dropped");
                return Vec::new();
            }
            self.completed_seen = true;
        }
        if self.local_ready {
            vec![candidate]
        } else {
            self.local.push(candidate);
            Vec::new()
        }
    }

    /// Local description applied: release everything held so far.
    pub fn local_description_set(&mut self) -> Vec<TrickleCandidate> {
        self.local_ready = true;
        std::mem::take(&mut self.local)
    }

    /// Remote candidate from the gateway. Returns it if it may be applied now.
    pub fn push_remote(&mut self, candidate: TrickleCandidate) -> Option<TrickleCandidate> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.remote.push(candidate);
            None
        }
    }

    /// Remote description applied: release buffered candidates in arrival order.
    pub fn remote_description_set(&mut self) -> Vec<TrickleCandidate> {
        self.remote_ready = true;
        std::mem::take(&mut self.remote)
    }

    pub fn buffered_remote(&self) -> usize {
        self.remote.len()
    }

    /// Forget everything; the next call starts from scratch.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
