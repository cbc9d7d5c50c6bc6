//! Slipstream control plane.
//!
//! Owns the durable node store contract and the registration-time model
//! verification gate. The HTTP handlers that drive both live in the proxy
//! engine; this crate stays free of server plumbing.

pub mod store;
pub mod verify;

pub use store::{JsonFileStore, MemoryStore, NodeStore};
