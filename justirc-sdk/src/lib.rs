//! JustIRC client SDK.
//!
//! Clients own all cryptographic state; the server only routes. This crate
//! provides the pieces a client needs:
//!
//! - [`proto`] - the newline-delimited JSON wire protocol
//! - [`validate`] - syntactic validation shared with the server
//! - [`crypto`] - X25519 + HKDF-SHA256 + ChaCha20-Poly1305 sessions,
//!   symmetric channel keys, and the rekey protocol
//! - [`transfer`] - chunked encrypted file transfer
//! - [`client`] / [`event`] - an async client handle and its event stream

pub mod client;
pub mod crypto;
pub mod event;
pub mod proto;
pub mod transfer;
pub mod validate;

pub use client::{connect, ClientConfig, ClientHandle};
pub use event::Event;
