//! CDP (Chrome DevTools Protocol) Client Implementation
//!
//! Core principle: Single WebSocket connection, multiplexed sessions.
//! No locks in hot path - use message passing instead.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::{CDPClient, CDPError};
pub use protocol::{CDPEvent, CDPRequest, CDPResponse, TargetInfo, TargetSummary, VersionInfo};
pub use session::CDPSession;
