//! Minimal STUN (RFC 5389) Binding client for server-reflexive candidates.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::net::UdpSocket;

use super::ice::{compute_priority, CandidateType, IceCandidate, Protocol};

/// STUN magic cookie (RFC 5389).
const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Type + length + magic + transaction ID.
const STUN_HEADER_SIZE: usize = 20;

const DEFAULT_STUN_PORT: u16 = 3478;

/// Per-attempt wait for a Binding response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Extract `host:port` from a `stun:` URL. Other schemes yield `None`.
pub fn stun_host(url: &str) -> Option<String> {
    let rest = url.strip_prefix("stun:")?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    // `[v6]:port`, `host:port` or bare host.
    let has_port = if rest.starts_with('[') {
        rest.contains("]:")
    } else {
        rest.contains(':')
    };
    if has_port {
        Some(rest.to_string())
    } else {
        Some(format!("{}:{}", rest, DEFAULT_STUN_PORT))
    }
}

/// Random 12-byte STUN transaction ID.
pub fn generate_transaction_id() -> Result<[u8; 12]> {
    let mut txn = [0u8; 12];
    getrandom::getrandom(&mut txn).map_err(|e| anyhow!("OS CSPRNG failed: {}", e))?;
    Ok(txn)
}

/// Binding Request, header only.
pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STUN_HEADER_SIZE);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf
}

/// Mapped address from a Binding Success Response to `transaction_id`.
pub fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if data.len() < STUN_HEADER_SIZE {
        bail!("short STUN message ({} bytes)", data.len());
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        bail!("not a binding success response (type {:#06x})", msg_type);
    }
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != MAGIC_COOKIE {
        bail!("bad magic cookie");
    }
    if &data[8..20] != transaction_id {
        bail!("transaction id mismatch");
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let attrs_end = std::cmp::min(STUN_HEADER_SIZE + msg_len, data.len());
    let mut fallback = None;

    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;
        let end = start + attr_len;
        if end > attrs_end {
            break;
        }
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(&data[start..end], Some(transaction_id)) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => fallback = decode_address(&data[start..end], None),
            _ => {}
        }
        // Attributes are padded to 4 bytes.
        pos = start + ((attr_len + 3) & !3);
    }

    fallback.ok_or_else(|| anyhow!("binding response without a mapped address"))
}

/// Decode (XOR-)MAPPED-ADDRESS. `xor` carries the transaction ID for the XOR form.
fn decode_address(value: &[u8], xor: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);

    let mut key = [0u8; 16];
    if let Some(txn) = xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        key[4..].copy_from_slice(txn);
    }

    match family {
        0x01 if value.len() >= 8 => {
            let mut o = [0u8; 4];
            for i in 0..4 {
                o[i] = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(o)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut o = [0u8; 16];
            for i in 0..16 {
                o[i] = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(o)), port))
        }
        _ => None,
    }
}

/// Ask `server` (`host:port`) for our public mapping of `socket`.
pub async fn gather_srflx_candidate(socket: &UdpSocket, server: &str) -> Result<IceCandidate> {
    let server_addr = tokio::net::lookup_host(server)
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| anyhow!("{} has no IPv4 address", server))?;

    let txn_id = generate_transaction_id()?;
    let request = build_binding_request(&txn_id);
    let local_addr = socket.local_addr()?;

    for attempt in 0..2 {
        socket.send_to(&request, server_addr).await?;

        let mut buf = [0u8; 512];
        match tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if from == server_addr => {
                match parse_binding_response(&buf[..len], &txn_id) {
                    Ok(mapped) => {
                        tracing::debug!("STUN {} mapped us to {}", server, mapped);
                        return Ok(IceCandidate {
                            foundation: "2".into(),
                            component: 1,
                            protocol: Protocol::Udp,
                            priority: compute_priority(CandidateType::ServerReflexive, 65535, 1),
                            address: mapped.ip().to_string(),
                            port: mapped.port(),
                            candidate_type: CandidateType::ServerReflexive,
                            raddr: Some(local_addr.ip().to_string()),
                            rport: Some(local_addr.port()),
                        });
                    }
                    Err(e) => tracing::debug!("Ignoring STUN reply: {:#}", e),
                }
            }
            Ok(Ok((_, from))) => tracing::debug!("Ignoring datagram from {}", from),
            Ok(Err(e)) => tracing::debug!("STUN recv error (attempt {}): {}", attempt, e),
            Err(_) => tracing::debug!("STUN timeout (attempt {})", attempt),
        }
    }

    bail!("no binding response from {}", server)
}
