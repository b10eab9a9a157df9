//! Kaillera Relay Server Library
//!
//! A netplay relay speaking Kaillera protocol v086 over UDP.
//!
//! # Layout
//!
//! - `net` - wire codec, connect server, admission and per-client sessions
//! - `action` - handlers for inbound messages and lobby events
//! - `lobby` - in-memory users, games and the events between them

pub mod action;
pub mod config;
pub mod lobby;
pub mod metrics;
pub mod net;
