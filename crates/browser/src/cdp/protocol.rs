//! CDP Protocol Types
//!
//! Fundamental types for CDP communication: the WebSocket frames plus the
//! HTTP metadata shapes served on `/json/version` and `/json`.
//! Keep them minimal - add domain-specific types only when needed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request ID - monotonically increasing
pub type RequestId = u64;

/// Target ID from Chrome
pub type TargetId = String;

/// Session ID for attached targets
pub type SessionId = String;

/// Browser context ID (the default context has none)
pub type BrowserContextId = String;

/// CDP Request sent to browser
#[derive(Debug, Clone, Serialize)]
pub struct CDPRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// CDP Response from browser
#[derive(Debug, Clone, Deserialize)]
pub struct CDPResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CDPProtocolError>,
}

/// Error payload inside a CDP response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CDPProtocolError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// CDP Event from browser (no request ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CDPEvent {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Unified CDP Message (response or event)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CDPMessage {
    Response(CDPResponse),
    Event(CDPEvent),
}

/// Target Info from Target.getTargets / Target.getTargetInfo
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub attached: bool,
    #[serde(rename = "browserContextId", default)]
    pub browser_context_id: Option<BrowserContextId>,
}

/// Result of Target.attachToTarget
#[derive(Debug, Clone, Deserialize)]
pub struct AttachToTargetResult {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

/// `/json/version` response. Partially initialized browsers can answer
/// without a handshake address - that is an Option, not a crash.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: Option<String>,
    #[serde(rename = "Browser", default)]
    pub browser: Option<String>,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: Option<String>,
}

impl VersionInfo {
    /// The resolved handshake address, if the browser reported a usable one.
    pub fn handshake_url(&self) -> Option<&str> {
        self.web_socket_debugger_url
            .as_deref()
            .filter(|url| !url.is_empty())
    }
}

/// One row of the `/json` target listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSummary {
    pub id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
}

impl TargetSummary {
    /// Pages with a routable URL are the only targets worth probing for cookies.
    pub fn is_http_page(&self) -> bool {
        self.target_type == "page"
            && (self.url.starts_with("http://") || self.url.starts_with("https://"))
    }
}
