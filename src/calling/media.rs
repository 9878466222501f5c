//! Bookkeeping for the media resources a call holds.

use std::fmt;

/// Something an engine acquires for a call and must give back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    PeerConnection,
    Capturer,
    SurfaceHelper,
    LocalStream,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PeerConnection => "peer connection",
            Self::Capturer => "video capturer",
            Self::SurfaceHelper => "surface texture helper",
            Self::LocalStream => "local media stream",
        })
    }
}

/// Release order: the peer connection first, the local stream last.
const RELEASE_ORDER: [Resource; 4] = [
    Resource::PeerConnection,
    Resource::Capturer,
    Resource::SurfaceHelper,
    Resource::LocalStream,
];

#[derive(Debug, Default)]
pub struct MediaResources {
    held: Vec<Resource>,
}

impl MediaResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, resource: Resource) {
        if !self.held.contains(&resource) {
            tracing::debug!("Acquired {}", resource);
            self.held.push(resource);
        }
    }

    pub fn holds(&self, resource: Resource) -> bool {
        self.held.contains(&resource)
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Give everything back in release order. A second call returns nothing.
    pub fn release(&mut self) -> Vec<Resource> {
        let released: Vec<Resource> = RELEASE_ORDER
            .iter()
            .copied()
            .filter(|r| self.held.contains(r))
            .collect();
        for r in &released {
            tracing::debug!("Released {}", r);
        }
        self.held.clear();
        released
    }
}
