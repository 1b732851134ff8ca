//! CDP Session - Represents a connection to a specific browser target
//!
//! Design: Lightweight wrapper around CDPClient with target-specific context.
//! All sessions share the same WebSocket - no per-session connection overhead.

use super::client::{CDPClient, Result};
use super::protocol::{AttachToTargetResult, SessionId, TargetId};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// CDP Session bound to a specific target
#[derive(Clone)]
pub struct CDPSession {
    /// Shared CDP client
    client: Arc<CDPClient>,

    /// Target this session is attached to
    pub target_id: TargetId,

    /// Session ID assigned by Chrome
    pub session_id: SessionId,
}

impl CDPSession {
    /// Attach to a target and create session
    pub async fn attach(
        client: Arc<CDPClient>,
        target_id: TargetId,
        domains: Option<Vec<&str>>,
    ) -> Result<Self> {
        // Attach to target
        let result = client
            .send_request(
                "Target.attachToTarget",
                Some(json!({
                    "targetId": target_id,
                    "flatten": true,
                })),
                None,
            )
            .await?;

        let attach_result: AttachToTargetResult = serde_json::from_value(result)?;
        let session_id = attach_result.session_id;

        // Enable domains (default set if not specified)
        let domains = domains.unwrap_or_else(|| vec!["Page", "Runtime", "Network"]);

        // Enable all domains in parallel
        let enable_futures: Vec<_> = domains
            .into_iter()
            .map(|domain| {
                let client = client.clone();
                let session_id = session_id.clone();
                async move {
                    client
                        .send_request(format!("{}.enable", domain), None, Some(session_id))
                        .await
                }
            })
            .collect();

        // Wait for all enables (ignore individual failures)
        let results = futures_util::future::join_all(enable_futures).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            tracing::warn!("Some domain enables failed: {}/{}", failures, results.len());
        }

        Ok(Self {
            client,
            target_id,
            session_id,
        })
    }

    /// Send command within this session's context
    pub async fn send(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.client
            .send_request(method, params, Some(self.session_id.clone()))
            .await
    }

    /// Navigate and wait for the document-loaded signal (not full load),
    /// bounded by `timeout`. Chrome fires Page.domContentEventFired on the
    /// attached session once the DOM is parsed.
    pub async fn navigate_and_wait(&self, url: impl Into<String>, timeout: Duration) -> Result<()> {
        let url = url.into();
        let wait = self.client.wait_for_event(
            "Page.domContentEventFired",
            Some(self.session_id.clone()),
            timeout,
        );
        // The waiter is listed first so its subscription is registered before
        // the navigate request ever reaches the wire.
        let (waited, nav) = tokio::join!(
            wait,
            self.send("Page.navigate", Some(json!({ "url": url })))
        );
        nav?;
        waited?;
        Ok(())
    }

    /// Fixed-viewport emulation for pages opened in freshly created contexts.
    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.send(
            "Emulation.setDeviceMetricsOverride",
            Some(json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            })),
        )
        .await?;
        Ok(())
    }

    /// Override the user agent for this page.
    pub async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.send(
            "Network.setUserAgentOverride",
            Some(json!({ "userAgent": user_agent })),
        )
        .await?;
        Ok(())
    }

    /// Register a script evaluated before any page script on future documents.
    pub async fn add_init_script(&self, source: &str) -> Result<()> {
        self.send(
            "Page.addScriptToEvaluateOnNewDocument",
            Some(json!({ "source": source })),
        )
        .await?;
        Ok(())
    }

    /// Detach without closing the target (used after one-off per-page work).
    pub async fn detach(&self) -> Result<()> {
        self.client
            .send_request(
                "Target.detachFromTarget",
                Some(json!({ "sessionId": &self.session_id })),
                None,
            )
            .await?;
        Ok(())
    }
}
