//! Janus gateway protocol: envelopes, transaction correlation and the
//! session/handle lifecycle.

pub mod envelope;
pub mod session;
pub mod transaction;
