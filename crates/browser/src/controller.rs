//! Connection negotiation and the browser-level controller handle
//!
//! Two-step connect: resolve the handshake address from `/json/version`, then
//! open the WebSocket. No retries here - retry/backoff belongs to the launch
//! readiness loop in the session manager, not around this call.

use std::sync::Arc;

use crate::cdp::client::{CDPClient, CDPError};
use crate::cdp::protocol::TargetInfo;
use crate::context::{BrowsingContext, ContextOptions};
use crate::error::SessionError;
use crate::probe::{Endpoint, ReadinessProbe, VERSION_FETCH_TIMEOUT};

/// Resolve the handshake address and perform the CDP handshake.
pub async fn connect(
    probe: &ReadinessProbe,
    endpoint: &Endpoint,
) -> Result<Controller, SessionError> {
    let version = probe
        .fetch_version(endpoint, VERSION_FETCH_TIMEOUT)
        .await
        .map_err(|e| SessionError::connection_with("handshake address fetch failed", e))?;

    let ws_url = version
        .handshake_url()
        .ok_or_else(|| SessionError::connection("missing webSocketDebuggerUrl in /json/version"))?
        .to_string();

    tracing::info!("connecting over CDP: {}", ws_url);

    let client = CDPClient::connect(&ws_url)
        .await
        .map_err(|e| SessionError::connection_with("CDP handshake failed", e))?;

    if !client.is_connected() {
        return Err(SessionError::connection("handshake reported connected=false"));
    }

    if let Some(browser) = version.browser.as_deref() {
        tracing::info!("connected to {}", browser);
    }

    Ok(Controller { client, ws_url })
}

/// Active connection to the browser's control surface. Exactly one exists per
/// session manager; closing it invalidates every context derived from it.
#[derive(Debug)]
pub struct Controller {
    client: Arc<CDPClient>,
    ws_url: String,
}

impl Controller {
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Browser product string, e.g. "Chrome/120.0.6099.71".
    pub async fn version(&self) -> Result<String, CDPError> {
        let result = self.client.send_request("Browser.getVersion", None, None).await?;
        Ok(result["product"].as_str().unwrap_or_default().to_string())
    }

    /// Browsing contexts as the browser reports them: page targets grouped by
    /// context id, in stable first-seen order. The first entry is the one a
    /// human's logged-in tabs live in.
    pub async fn contexts(&self) -> Result<Vec<BrowsingContext>, CDPError> {
        let result = self.client.send_request("Target.getTargets", None, None).await?;
        let infos: Vec<TargetInfo> = serde_json::from_value(result["targetInfos"].clone())?;

        Ok(group_page_targets(&infos)
            .into_iter()
            .map(|(id, pages)| BrowsingContext::adopted(self.client.clone(), id, pages))
            .collect())
    }

    /// Create an isolated context. Cookie-empty by construction.
    pub async fn new_context(
        &self,
        options: ContextOptions,
    ) -> Result<BrowsingContext, SessionError> {
        let result = self
            .client
            .send_request("Target.createBrowserContext", None, None)
            .await
            .map_err(SessionError::ContextCreation)?;

        let context_id = result["browserContextId"]
            .as_str()
            .ok_or_else(|| {
                SessionError::ContextCreation(CDPError::Protocol {
                    code: -1,
                    message: "createBrowserContext returned no browserContextId".to_string(),
                })
            })?
            .to_string();

        let context = BrowsingContext::fresh(self.client.clone(), context_id, options);
        context.allow_downloads().await;
        Ok(context)
    }

    /// Close the WebSocket. The caller is tearing down and decides what to
    /// do with a failure.
    pub async fn close(&self) -> Result<(), CDPError> {
        self.client.close().await
    }
}

/// Group page targets by browser context id, preserving the order the browser
/// reported them in. Targets without a context id (older browsers) coalesce
/// into one unkeyed group.
fn group_page_targets(infos: &[TargetInfo]) -> Vec<(Option<String>, Vec<TargetInfo>)> {
    let mut groups: Vec<(Option<String>, Vec<TargetInfo>)> = Vec::new();

    for info in infos {
        if info.target_type != "page" {
            continue;
        }
        let key = info.browser_context_id.clone();
        match groups.iter_mut().find(|(id, _)| *id == key) {
            Some((_, pages)) => pages.push(info.clone()),
            None => groups.push((key, vec![info.clone()])),
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::endpoint_for;
    use crate::probe::PROBE_TIMEOUT;

    fn page(target_id: &str, context_id: Option<&str>) -> TargetInfo {
        TargetInfo {
            target_id: target_id.to_string(),
            target_type: "page".to_string(),
            title: String::new(),
            url: "https://example.com".to_string(),
            attached: false,
            browser_context_id: context_id.map(String::from),
        }
    }

    #[test]
    fn grouping_preserves_first_seen_order() {
        let mut worker = page("W", Some("CTX2"));
        worker.target_type = "service_worker".to_string();

        let infos = vec![
            page("A", Some("CTX1")),
            page("B", Some("CTX2")),
            page("C", Some("CTX1")),
            worker,
        ];

        let groups = group_page_targets(&infos);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.as_deref(), Some("CTX1"));
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0.as_deref(), Some("CTX2"));
        assert_eq!(groups[1].1.len(), 1);
    }

    #[test]
    fn grouping_coalesces_unkeyed_targets() {
        let infos = vec![page("A", None), page("B", None)];
        let groups = group_page_targets(&infos);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[tokio::test]
    async fn connect_fails_without_handshake_address() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/json/version")
            .with_status(200)
            .with_body(r#"{"Browser": "Chrome/120.0.6099.71"}"#)
            .create_async()
            .await;

        let probe = ReadinessProbe::new();
        let err = connect(&probe, &endpoint_for(&server)).await.unwrap_err();
        assert!(err.to_string().contains("webSocketDebuggerUrl"));
    }

    #[tokio::test]
    async fn connect_fails_when_handshake_target_is_dead() {
        // Metadata answers, but the advertised WebSocket port has no listener.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/json/version")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "webSocketDebuggerUrl":
                        format!("ws://127.0.0.1:{}/devtools/browser/abc", dead_port)
                })
                .to_string(),
            )
            .create_async()
            .await;

        let probe = ReadinessProbe::new();
        let endpoint = endpoint_for(&server);
        assert!(probe.is_ready(&endpoint, PROBE_TIMEOUT).await);

        let err = connect(&probe, &endpoint).await.unwrap_err();
        match err {
            SessionError::Connection { reason, source } => {
                assert!(reason.contains("CDP handshake failed"));
                assert!(source.is_some());
            }
            other => panic!("expected Connection error, got {:?}", other),
        }
    }
}
