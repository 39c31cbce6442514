//! # Crucible application library
//!
//! The async half of Crucible: HTTP API, live event hub, promotion sweep
//! scheduler and layered configuration. The binary in `main.rs` adds the
//! CLI on top.

pub mod api;
pub mod config;
pub mod scheduler;
