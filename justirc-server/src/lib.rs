//! JustIRC routing server.
//!
//! A zero-knowledge relay: clients hold all cryptographic state, the server
//! reads only envelopes and routing fields. Message bodies are never
//! decrypted, logged, or persisted.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod ipfilter;
pub mod rate;
pub mod registry;
pub mod server;
pub mod sessions;
