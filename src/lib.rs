//! line-relay: a multiplexed TCP line broadcast relay
//!
//! Clients connect over TCP and send newline-terminated lines. Every line
//! is relayed to all other connected clients, prefixed with the sender's
//! address. `-q` disconnects the sender and `-s` is ignored.
//!
//! Features:
//! - Single-threaded readiness loop (mio) or task-per-connection (tokio)
//! - Stable per-session slots, reused lowest-first after teardown
//! - Capacity limit with non-fatal rejection of extra connections
//! - Per-event read budget and bounded per-peer output queues
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod error;
pub mod relay;
