//! Readiness probing against the browser's HTTP debug endpoint
//!
//! One bounded request per call, no retries - retry policy belongs to the
//! caller. A refused connection or malformed body is an expected signal
//! ("nothing usable here"), not a failure.

use std::time::Duration;

use crate::cdp::protocol::{TargetSummary, VersionInfo};
use crate::error::ProbeError;

/// Short bound for liveness checks.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Longer bound for the handshake-address fetch - the process can be alive
/// but still initializing its DevTools server.
pub const VERSION_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Network location of the debug endpoint. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Polls the `/json/version` metadata path to decide whether a control
/// channel is live, and fetches the target listing for cookie federation.
pub struct ReadinessProbe {
    http: reqwest::Client,
}

impl ReadinessProbe {
    pub fn new() -> Self {
        // Bypass any system proxy - the debug endpoint is loopback and a
        // proxied request would report the proxy's reachability, not Chrome's.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    /// Single bounded check: is a debuggable browser answering on `endpoint`?
    /// True only for a well-formed `/json/version` body carrying a non-empty
    /// handshake address.
    pub async fn is_ready(&self, endpoint: &Endpoint, timeout: Duration) -> bool {
        match self.fetch_version(endpoint, timeout).await {
            Ok(info) => info.handshake_url().is_some(),
            Err(e) => {
                tracing::debug!("readiness probe on {} missed: {}", endpoint, e);
                false
            }
        }
    }

    /// Fetch `/json/version`. Used by the readiness check and, with a longer
    /// timeout, by connection negotiation to resolve the handshake address.
    pub async fn fetch_version(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<VersionInfo, ProbeError> {
        let response = self
            .http
            .get(endpoint.url("/json/version"))
            .timeout(timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }

        Ok(response.json::<VersionInfo>().await?)
    }

    /// Fetch the `/json` target listing - every open page the browser reports.
    pub async fn list_targets(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Vec<TargetSummary>, ProbeError> {
        let response = self
            .http
            .get(endpoint.url("/json"))
            .timeout(timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }

        Ok(response.json::<Vec<TargetSummary>>().await?)
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new()
    }
}
