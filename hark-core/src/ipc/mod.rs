//! Serialisable event types for hosts.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` with camelCase
//! fields and lowercase tags so they can be forwarded as JSON unchanged.

pub mod events;
