//! SDP generation and inspection for the probe engine.
//!
//! Produces WebRTC-shaped descriptions: one BUNDLE group with an audio
//! (Opus) and a video (H.264) m-line sharing ICE credentials. Parsing only
//! extracts what is needed to answer an offer and to sanity-check remote
//! descriptions.

use std::fmt::Write as _;

use anyhow::{anyhow, bail, Result};

use super::engine::{MediaConstraints, MediaKind};

/// H.264 Constrained High, level 3.1.
const PROFILE_HIGH: &str = "640c1f";
/// H.264 Constrained Baseline, level 3.1.
const PROFILE_BASELINE: &str = "42e01f";

/// Direction attribute of a media section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sendrecv" => Self::SendRecv,
            "sendonly" => Self::SendOnly,
            "recvonly" => Self::RecvOnly,
            "inactive" => Self::Inactive,
            _ => return None,
        })
    }

    /// What we answer to a remote direction.
    fn reversed(self) -> Self {
        match self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            other => other,
        }
    }
}

/// Local transport parameters shared by every m-line.
#[derive(Debug, Clone)]
pub struct LocalParams {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// `sha-256` fingerprint, colon-separated upper-case hex.
    pub fingerprint: String,
    pub session_id: u64,
    pub h264_high_profile: bool,
}

impl LocalParams {
    pub fn generate(h264_high_profile: bool) -> Result<Self> {
        let session: [u8; 8] = rand_bytes()?;
        Ok(Self {
            ice_ufrag: generate_ice_ufrag()?,
            ice_pwd: generate_ice_pwd()?,
            fingerprint: generate_fingerprint()?,
            // Keep it positive when read as a signed 64-bit number.
            session_id: u64::from_be_bytes(session) >> 1,
            h264_high_profile,
        })
    }
}

/// One m-line of a parsed description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: Direction,
    pub codecs: Vec<String>,
}

/// The parts of a remote description the probe engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSummary {
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub fingerprint: Option<String>,
    pub sections: Vec<MediaSection>,
    pub candidates: Vec<String>,
}

impl SdpSummary {
    pub fn has(&self, kind: MediaKind) -> bool {
        self.sections.iter().any(|s| s.kind == kind)
    }
}

/// Parse the bits of `sdp` listed in [`SdpSummary`].
pub fn parse_summary(sdp: &str) -> Result<SdpSummary> {
    let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("v=0") {
        bail!("description does not start with v=0");
    }

    let mut summary = SdpSummary {
        ice_ufrag: None,
        ice_pwd: None,
        fingerprint: None,
        sections: Vec::new(),
        candidates: Vec::new(),
    };

    for line in lines {
        if let Some(m) = line.strip_prefix("m=") {
            let kind = match m.split_whitespace().next() {
                Some("audio") => MediaKind::Audio,
                Some("video") => MediaKind::Video,
                Some(other) => {
                    tracing::debug!("Skipping unsupported m-line: {}", other);
                    continue;
                }
                None => bail!("empty m-line"),
            };
            summary.sections.push(MediaSection {
                kind,
                mid: summary.sections.len().to_string(),
                direction: Direction::SendRecv,
                codecs: Vec::new(),
            });
            continue;
        }

        let attr = match line.strip_prefix("a=") {
            Some(a) => a,
            None => continue,
        };
        let (name, value) = attr.split_once(':').unwrap_or((attr, ""));
        match name {
            "ice-ufrag" => summary.ice_ufrag = Some(value.to_string()),
            "ice-pwd" => summary.ice_pwd = Some(value.to_string()),
            "fingerprint" => summary.fingerprint = Some(value.to_string()),
            "candidate" => summary.candidates.push(format!("candidate:{}", value)),
            _ => {}
        }

        if let Some(section) = summary.sections.last_mut() {
            match name {
                "mid" => section.mid = value.to_string(),
                "rtpmap" => {
                    if let Some(codec) = value.split_whitespace().nth(1) {
                        let name = codec.split('/').next().unwrap_or(codec);
                        section.codecs.push(name.to_string());
                    }
                }
                other => {
                    if let Some(d) = Direction::parse(other) {
                        section.direction = d;
                    }
                }
            }
        }
    }

    if summary.sections.is_empty() {
        bail!("description has no audio or video section");
    }
    Ok(summary)
}

/// Offer with one audio and one video m-line, as the constraints allow.
pub fn generate_offer(local: &LocalParams, constraints: &MediaConstraints) -> String {
    let audio = if constraints.receive_audio {
        Direction::SendRecv
    } else {
        Direction::SendOnly
    };
    let video = if constraints.receive_video {
        Direction::SendRecv
    } else {
        Direction::SendOnly
    };
    let sections = [
        (MediaKind::Audio, "0".to_string(), audio),
        (MediaKind::Video, "1".to_string(), video),
    ];
    render(local, "actpass", &sections)
}

/// Answer mirroring the offered m-lines.
pub fn generate_answer(local: &LocalParams, offer: &SdpSummary) -> Result<String> {
    let sections: Vec<(MediaKind, String, Direction)> = offer
        .sections
        .iter()
        .map(|s| (s.kind, s.mid.clone(), s.direction.reversed()))
        .collect();
    if offer.ice_ufrag.is_none() || offer.ice_pwd.is_none() {
        return Err(anyhow!("offer carries no ICE credentials"));
    }
    Ok(render(local, "active", &sections))
}

fn render(local: &LocalParams, setup: &str, sections: &[(MediaKind, String, Direction)]) -> String {
    let mut sdp = String::new();
    let mids: Vec<&str> = sections.iter().map(|(_, mid, _)| mid.as_str()).collect();

    // Writing into a String cannot fail.
    let _ = write!(
        sdp,
        "v=0\r\n\
         o=- {} 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE {}\r\n\
         a=msid-semantic: WMS janus-videocall\r\n",
        local.session_id,
        mids.join(" ")
    );

    for (kind, mid, direction) in sections {
        let (payloads, codecs) = match kind {
            MediaKind::Audio => ("111", audio_codecs()),
            MediaKind::Video => ("102 103", video_codecs(local.h264_high_profile)),
        };
        let _ = write!(
            sdp,
            "m={} 9 UDP/TLS/RTP/SAVPF {}\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=rtcp:9 IN IP4 0.0.0.0\r\n\
             a=ice-ufrag:{}\r\n\
             a=ice-pwd:{}\r\n\
             a=ice-options:trickle\r\n\
             a=fingerprint:sha-256 {}\r\n\
             a=setup:{}\r\n\
             a=mid:{}\r\n\
             a={}\r\n\
             a=rtcp-mux\r\n",
            kind,
            payloads,
            local.ice_ufrag,
            local.ice_pwd,
            local.fingerprint,
            setup,
            mid,
            direction.as_str()
        );
        sdp.push_str(&codecs);
    }
    sdp
}

fn audio_codecs() -> String {
    "a=rtpmap:111 opus/48000/2\r\n\
     a=rtcp-fb:111 transport-cc\r\n\
     a=fmtp:111 minptime=10;useinbandfec=1\r\n"
        .to_string()
}

fn video_codecs(high_profile: bool) -> String {
    let profile = if high_profile {
        PROFILE_HIGH
    } else {
        PROFILE_BASELINE
    };
    format!(
        "a=rtpmap:102 H264/90000\r\n\
         a=rtcp-fb:102 nack\r\n\
         a=rtcp-fb:102 nack pli\r\n\
         a=rtcp-fb:102 ccm fir\r\n\
         a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}\r\n\
         a=rtpmap:103 rtx/90000\r\n\
         a=fmtp:103 apt=102\r\n",
        profile
    )
}

/// Random 4-character ICE ufrag.
pub fn generate_ice_ufrag() -> Result<String> {
    let bytes: [u8; 2] = rand_bytes()?;
    Ok(hex(&bytes))
}

/// Random 24-character ICE password (hex keeps SDP parsers happy).
pub fn generate_ice_pwd() -> Result<String> {
    let bytes: [u8; 12] = rand_bytes()?;
    Ok(hex(&bytes))
}

/// Placeholder DTLS fingerprint; the probe never runs a handshake.
fn generate_fingerprint() -> Result<String> {
    let bytes: [u8; 32] = rand_bytes()?;
    Ok(bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Cryptographically secure random bytes from the OS.
fn rand_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("OS CSPRNG failed: {}", e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(high: bool) -> LocalParams {
        LocalParams {
            ice_ufrag: "abcd".into(),
            ice_pwd: "0123456789abcdef01234567".into(),
            fingerprint: "AA:BB".into(),
            session_id: 42,
            h264_high_profile: high,
        }
    }

    #[test]
    fn test_offer_bundles_audio_and_video() {
        let sdp = generate_offer(&local(true), &MediaConstraints::default());
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("a=group:BUNDLE 0 1\r\n"));
        assert!(sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"));
        assert!(sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 102 103\r\n"));
        assert!(sdp.contains("profile-level-id=640c1f"));
        assert!(sdp.contains("a=setup:actpass"));
        assert_eq!(sdp.matches("a=sendrecv").count(), 2);

        let summary = parse_summary(&sdp).unwrap();
        assert_eq!(summary.ice_ufrag.as_deref(), Some("abcd"));
        assert_eq!(summary.sections.len(), 2);
        assert_eq!(summary.sections[0].codecs, vec!["opus"]);
        assert_eq!(summary.sections[1].codecs, vec!["H264", "rtx"]);
    }

    #[test]
    fn test_baseline_profile_when_high_disabled() {
        let sdp = generate_offer(&local(false), &MediaConstraints::default());
        assert!(sdp.contains("profile-level-id=42e01f"));
        assert!(!sdp.contains("640c1f"));
    }

    #[test]
    fn test_send_only_without_receive_constraints() {
        let sdp = generate_offer(
            &local(true),
            &MediaConstraints {
                receive_audio: false,
                receive_video: true,
            },
        );
        let summary = parse_summary(&sdp).unwrap();
        assert_eq!(summary.sections[0].direction, Direction::SendOnly);
        assert_eq!(summary.sections[1].direction, Direction::SendRecv);
    }

    #[test]
    fn test_answer_mirrors_browser_offer() {
        let offer = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE audio video\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=ice-ufrag:Xy1z\r\n\
a=ice-pwd:remotepasswordremotepass\r\n\
a=fingerprint:sha-256 11:22\r\n\
a=mid:audio\r\n\
a=sendonly\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:video\r\n\
a=recvonly\r\n\
a=rtpmap:96 VP8/90000\r\n";
        let summary = parse_summary(offer).unwrap();
        assert_eq!(summary.candidates.len(), 1);
        assert!(summary.has(MediaKind::Video));

        let answer = generate_answer(&local(true), &summary).unwrap();
        assert!(answer.contains("a=group:BUNDLE audio video\r\n"));
        assert!(answer.contains("a=setup:active"));
        let parsed = parse_summary(&answer).unwrap();
        assert_eq!(parsed.sections[0].mid, "audio");
        assert_eq!(parsed.sections[0].direction, Direction::RecvOnly);
        assert_eq!(parsed.sections[1].direction, Direction::SendOnly);
    }

    #[test]
    fn test_reject_non_sdp() {
        assert!(parse_summary("O").is_err());
        assert!(parse_summary("v=0\r\ns=-\r\n").is_err());
    }

    #[test]
    fn test_credentials_shape() {
        let p = LocalParams::generate(true).unwrap();
        assert_eq!(p.ice_ufrag.len(), 4);
        assert_eq!(p.ice_pwd.len(), 24);
        assert_eq!(p.fingerprint.split(':').count(), 32);
        assert!(p.session_id < (1 << 63));
    }
}
