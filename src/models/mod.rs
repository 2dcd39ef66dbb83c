//! Core data models for the gatekeeper protocol.
//!
//! These types describe objects, the operations proposed against them, and
//! the grants the gatekeeper answers with. They serialize naturally as JSON
//! via `serde`, which is the wire format of the gatekeeper endpoint.

pub mod grant;
pub mod message;
pub mod object;
