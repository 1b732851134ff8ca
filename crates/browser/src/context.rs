//! Browsing context resolution - reuse an existing context or create one
//!
//! Reuse-first: the first context in the browser's stable reported order is
//! the one carrying a human's logged-in session. Only when nothing exists do
//! we create a fresh (cookie-empty) context and hand it to cookie federation.

use std::sync::Arc;

use serde_json::json;

use crate::cdp::client::{CDPClient, CDPError};
use crate::cdp::protocol::{BrowserContextId, TargetId, TargetInfo};
use crate::cdp::CDPSession;
use crate::controller::Controller;
use crate::cookies::Cookie;
use crate::error::SessionError;
use crate::session::ProxyConfig;

/// Options applied to freshly created contexts and their pages.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub viewport: (u32, u32),
    pub user_agent: Option<String>,
    pub accept_downloads: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            viewport: (1920, 1080),
            user_agent: None,
            accept_downloads: true,
        }
    }
}

/// Decide whether to reuse an existing browsing context or create one.
pub async fn resolve(
    controller: &Controller,
    proxy: Option<&ProxyConfig>,
    user_agent: Option<&str>,
) -> Result<BrowsingContext, SessionError> {
    let contexts = controller
        .contexts()
        .await
        .map_err(|e| SessionError::connection_with("listing browser contexts failed", e))?;

    if let Some(context) = contexts.into_iter().next() {
        // Reusing keeps the operator's login state. Page count is only a
        // diagnostic for cookie availability - zero pages is fine.
        tracing::info!(
            "reusing existing browser context with {} page(s)",
            context.page_count()
        );
        return Ok(context);
    }

    if proxy.is_some() {
        tracing::warn!(
            "proxy configured, but the browser process is already running; \
             its network stack is fixed and the proxy may be ineffective"
        );
    }

    let options = ContextOptions {
        user_agent: user_agent.map(String::from),
        ..ContextOptions::default()
    };
    if let Some(ua) = options.user_agent.as_deref() {
        tracing::info!("new context will override user agent: {}", ua);
    }

    let context = controller.new_context(options).await?;
    tracing::warn!(
        "created a fresh browser context; it has no login state until cookies are federated"
    );
    Ok(context)
}

/// An isolated cookie/storage jar plus its open pages. Either adopted
/// (discovered in the browser, already bearing state) or fresh (created by
/// us, empty). Cheap to clone - clones share the CDP connection.
#[derive(Clone, Debug)]
pub struct BrowsingContext {
    client: Arc<CDPClient>,
    /// None models the browser's default context, which has no id.
    id: Option<BrowserContextId>,
    fresh: bool,
    /// Page targets observed at discovery time (adopted contexts only).
    pages: Vec<TargetInfo>,
    options: ContextOptions,
}

impl BrowsingContext {
    pub(crate) fn adopted(
        client: Arc<CDPClient>,
        id: Option<BrowserContextId>,
        pages: Vec<TargetInfo>,
    ) -> Self {
        Self {
            client,
            id,
            fresh: false,
            pages,
            options: ContextOptions::default(),
        }
    }

    pub(crate) fn fresh(
        client: Arc<CDPClient>,
        id: BrowserContextId,
        options: ContextOptions,
    ) -> Self {
        Self {
            client,
            id: Some(id),
            fresh: true,
            pages: Vec::new(),
            options,
        }
    }

    /// True when this context was created by us (and is cookie-empty until
    /// federation runs).
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Pages known at discovery time.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn scope(&self) -> serde_json::Value {
        match &self.id {
            Some(id) => json!({ "browserContextId": id }),
            None => json!({}),
        }
    }

    /// Allow downloads for this context. Best-effort: some embedders reject
    /// the command, which must not fail context creation.
    pub(crate) async fn allow_downloads(&self) {
        if !self.options.accept_downloads {
            return;
        }
        let mut params = json!({
            "behavior": "allow",
            "downloadPath": std::env::temp_dir().to_string_lossy(),
        });
        if let Some(id) = &self.id {
            params["browserContextId"] = json!(id);
        }
        if let Err(e) = self
            .client
            .send_request("Browser.setDownloadBehavior", Some(params), None)
            .await
        {
            tracing::debug!("enabling downloads failed: {}", e);
        }
    }

    /// Read the context's full cookie jar.
    pub async fn cookies(&self) -> Result<Vec<Cookie>, CDPError> {
        let result = self
            .client
            .send_request("Storage.getCookies", Some(self.scope()), None)
            .await?;
        Ok(serde_json::from_value(result["cookies"].clone())?)
    }

    /// Install cookies into the context's jar.
    pub async fn add_cookies(&self, cookies: &[Cookie]) -> Result<(), CDPError> {
        let mut params = json!({ "cookies": cookies });
        if let Some(id) = &self.id {
            params["browserContextId"] = json!(id);
        }
        self.client
            .send_request("Storage.setCookies", Some(params), None)
            .await?;
        Ok(())
    }

    /// Open a page inside this context and attach to it. Fresh contexts get
    /// their viewport and user-agent overrides applied before first use.
    pub async fn new_page(&self, url: &str) -> Result<CDPSession, CDPError> {
        let mut params = json!({ "url": url });
        if let Some(id) = &self.id {
            params["browserContextId"] = json!(id);
        }
        let result = self
            .client
            .send_request("Target.createTarget", Some(params), None)
            .await?;

        let target_id = result["targetId"]
            .as_str()
            .ok_or_else(|| CDPError::Protocol {
                code: -1,
                message: "createTarget returned no targetId".to_string(),
            })?
            .to_string();
        let session = CDPSession::attach(self.client.clone(), target_id, None).await?;

        if self.fresh {
            let (width, height) = self.options.viewport;
            session.set_viewport(width, height).await?;
            if let Some(ua) = self.options.user_agent.as_deref() {
                session.set_user_agent(ua).await?;
            }
        }

        Ok(session)
    }

    /// Close a page unconditionally. Failures are logged, never raised - this
    /// runs on error paths where the page may already be gone.
    pub async fn close_page(&self, target_id: &TargetId) {
        let result = self
            .client
            .send_request(
                "Target.closeTarget",
                Some(json!({ "targetId": target_id })),
                None,
            )
            .await;
        if let Err(e) = result {
            tracing::debug!("closing page {} failed: {}", target_id, e);
        }
    }

    /// Register a startup script on every live page of this context.
    /// Returns how many pages it reached.
    pub async fn add_init_script(&self, source: &str) -> Result<usize, CDPError> {
        let result = self.client.send_request("Target.getTargets", None, None).await?;
        let infos: Vec<TargetInfo> = serde_json::from_value(result["targetInfos"].clone())?;

        let mut covered = 0;
        for info in infos {
            let in_scope = info.target_type == "page" && info.browser_context_id == self.id;
            if !in_scope {
                continue;
            }
            let session = CDPSession::attach(self.client.clone(), info.target_id, None).await?;
            session.add_init_script(source).await?;
            let _ = session.detach().await;
            covered += 1;
        }
        Ok(covered)
    }

    /// Close the context. Only contexts we created can be disposed; the
    /// browser refuses to dispose its default context, so adopted ones are
    /// left in place with a log line.
    pub async fn close(&self) -> Result<(), CDPError> {
        if !self.fresh {
            tracing::info!("leaving adopted browser context in place");
            return Ok(());
        }
        let id = self.id.as_deref().unwrap_or_default();
        self.client
            .send_request(
                "Target.disposeBrowserContext",
                Some(json!({ "browserContextId": id })),
                None,
            )
            .await?;
        Ok(())
    }
}
