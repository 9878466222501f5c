//! Call negotiation: the call state machine, the controller that drives a
//! media engine from it, and the signaling-only engine used by the CLI.
//!
//! Media streaming itself is out of scope; engines only need to produce and
//! consume SDP and ICE candidates.

pub mod controller;
pub mod engine;
pub mod ice;
pub mod machine;
pub mod media;
pub mod probe;
pub mod sdp;
pub mod stun;

pub use controller::{NegotiationConfig, NegotiationController};
pub use engine::MediaEngine;
pub use probe::ProbeEngine;
