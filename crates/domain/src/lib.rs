//! Shared types for every RoomBridge crate: errors, provider stream
//! events, tool call records, configuration, and trace events.

pub mod config;
pub mod error;
pub mod stream;
pub mod tool;
pub mod trace;
