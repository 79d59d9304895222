//! Claude Conductor - multi-session conversation core for host applications.
//!
//! Spawns and multiplexes Claude Code CLI interactions, turns the raw
//! stream-json events into structured conversation messages, handles rate
//! limits with automatic retry, queues messages per session, and tracks
//! every file the assistant edits so changes can be reverted or accepted.

pub mod cli;
pub mod config;
pub mod context;
pub mod handler;
pub mod orchestrator;
pub mod ratelimit;
pub mod session;
pub mod snapshot;
