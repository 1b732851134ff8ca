//! Browser Session Management
//!
//! This is the high-level API the embedding tool interacts with. Sequences
//! probing, launching, connecting, context resolution and cookie federation
//! behind one acquire call, and owns ordered teardown.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::context::{resolve, BrowsingContext};
use crate::controller::{self, Controller};
use crate::cookies::{Cookie, CookieFederator, FederationReport};
use crate::error::{Result, SessionError};
use crate::events::{EventBus, SessionEvent};
use crate::launcher::ProcessLauncher;
use crate::probe::{Endpoint, ReadinessProbe, PROBE_TIMEOUT};

/// Poll step of the launch readiness loop.
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Session configuration. Immutable once the manager is built - behavior is
/// driven by this value, not by ambient globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: String,
    pub host: String,
    pub debug_port: u16,
    /// Explicit browser binary; ignored (with a warning) when the file does
    /// not exist, falling through to auto-detection.
    pub custom_browser_path: Option<PathBuf>,
    /// Launch with a persistent profile so logins survive restarts.
    pub save_login_state: bool,
    pub user_data_root: PathBuf,
    /// Keys the persistent profile directory.
    pub platform: String,
    pub launch_timeout: Duration,
    /// Terminate the browser process during cleanup. Off by default so a
    /// human-launched browser survives the tool's exit.
    pub auto_close_on_cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            host: "127.0.0.1".to_string(),
            debug_port: 9222,
            custom_browser_path: None,
            save_login_state: true,
            user_data_root: PathBuf::from("browser_data"),
            platform: "default".to_string(),
            launch_timeout: Duration::from_secs(30),
            auto_close_on_cleanup: false,
        }
    }
}

impl SessionConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.debug_port)
    }

    /// Profile directory for persistent login state, keyed by platform.
    pub fn profile_dir(&self) -> Option<PathBuf> {
        self.save_login_state
            .then(|| self.user_data_root.join(format!("cdp_{}", self.platform)))
    }
}

/// Proxy settings supplied by the caller. Accepted, but CDP attaches to an
/// already-running process whose network stack is fixed - see the
/// degraded-mode warning in context resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Where an acquisition currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Init,
    Probing,
    Attaching,
    Launching,
    Connecting,
    ResolvingContext,
    Federating,
    Ready,
    Failed,
}

/// Snapshot returned by [`CDPBrowserManager::describe`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub version: Option<String>,
    pub context_count: usize,
    pub debug_port: u16,
    pub connected: bool,
}

/// Non-fatal diagnostics accumulated during teardown. Cleanup itself never
/// raises.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub issues: Vec<String>,
}

/// Browser session manager - acquires one authoritative CDP connection and
/// a working browsing context, preserving pre-existing cookies where it can.
pub struct CDPBrowserManager {
    pub config: SessionConfig,
    pub event_bus: EventBus,
    launcher: Box<dyn ProcessLauncher>,
    probe: ReadinessProbe,
    federator: CookieFederator,
    controller: Option<Controller>,
    context: Option<BrowsingContext>,
    state: SessionState,
}

impl CDPBrowserManager {
    pub fn new(config: SessionConfig, launcher: Box<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            event_bus: EventBus::new(),
            launcher,
            probe: ReadinessProbe::new(),
            federator: CookieFederator::new(),
            controller: None,
            context: None,
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Establish the session: attach to a running browser or launch one,
    /// connect over CDP, and hand back a usable browsing context. Any
    /// failure triggers full ordered cleanup before the error is re-raised -
    /// partial state is never left dangling.
    pub async fn acquire(
        &mut self,
        proxy: Option<&ProxyConfig>,
        user_agent: Option<&str>,
        headless: bool,
    ) -> Result<BrowsingContext> {
        match self.try_acquire(proxy, user_agent, headless).await {
            Ok(context) => {
                self.state = SessionState::Ready;
                Ok(context)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                tracing::error!("session acquisition failed: {}", e);
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn try_acquire(
        &mut self,
        proxy: Option<&ProxyConfig>,
        user_agent: Option<&str>,
        headless: bool,
    ) -> Result<BrowsingContext> {
        let endpoint = self.config.endpoint();

        self.state = SessionState::Probing;
        if self.probe.is_ready(&endpoint, PROBE_TIMEOUT).await {
            self.state = SessionState::Attaching;
            tracing::info!("browser already running on {}, attaching", endpoint);
            self.event_bus.publish(SessionEvent::ProbeSucceeded {
                port: endpoint.port,
            });
        } else {
            self.state = SessionState::Launching;
            tracing::info!("nothing on {}, launching a browser", endpoint);
            self.launch_and_wait(&endpoint, headless).await?;
        }

        self.state = SessionState::Connecting;
        let controller = controller::connect(&self.probe, &endpoint).await?;
        self.event_bus.publish(SessionEvent::Connected {
            ws_url: controller.ws_url().to_string(),
        });

        self.state = SessionState::ResolvingContext;
        let context = resolve(&controller, proxy, user_agent).await?;

        if context.is_fresh() {
            self.event_bus.publish(SessionEvent::ContextCreated);
            self.state = SessionState::Federating;
            let FederationReport { installed, .. } =
                self.federator.federate(&self.probe, &endpoint, &context).await;
            self.event_bus
                .publish(SessionEvent::CookiesFederated { installed });
        } else {
            self.event_bus.publish(SessionEvent::ContextReused {
                pages: context.page_count(),
            });
        }

        self.controller = Some(controller);
        self.context = Some(context.clone());
        Ok(context)
    }

    /// Launch the browser process and poll readiness up to the configured
    /// ceiling.
    async fn launch_and_wait(&mut self, endpoint: &Endpoint, headless: bool) -> Result<()> {
        let path = self.resolve_browser_path()?;

        let profile_dir = self.config.profile_dir();
        if let Some(dir) = &profile_dir {
            std::fs::create_dir_all(dir).map_err(SessionError::Spawn)?;
            tracing::info!("persistent profile directory: {}", dir.display());
        }

        self.event_bus.publish(SessionEvent::LaunchRequested {
            path: path.display().to_string(),
        });
        let handle = self
            .launcher
            .launch(&path, endpoint.port, headless, profile_dir.as_deref())
            .await
            .map_err(SessionError::Spawn)?;
        if let Some(pid) = handle.pid {
            tracing::info!("browser process started (pid {})", pid);
        }

        let deadline = Instant::now() + self.config.launch_timeout;
        loop {
            if self.probe.is_ready(endpoint, PROBE_TIMEOUT).await {
                break;
            }
            if Instant::now() >= deadline {
                return Err(SessionError::LaunchTimeout {
                    port: endpoint.port,
                    timeout: self.config.launch_timeout,
                });
            }
            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
        }

        // The DevTools server can answer /json/version slightly before the
        // WebSocket endpoint accepts connections; give it a moment to settle.
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !self.probe.is_ready(endpoint, PROBE_TIMEOUT).await {
            tracing::warn!("readiness re-check failed after launch; attempting connection anyway");
        }

        Ok(())
    }

    /// Explicit path if it exists, else the first detected candidate.
    fn resolve_browser_path(&self) -> Result<PathBuf> {
        if let Some(custom) = &self.config.custom_browser_path {
            if custom.is_file() {
                tracing::info!("using configured browser path: {}", custom.display());
                return Ok(custom.clone());
            }
            tracing::warn!(
                "configured browser path {} does not exist, falling back to auto-detection",
                custom.display()
            );
        }

        let candidates = self.launcher.detect_candidate_paths();
        let path = candidates.into_iter().next().ok_or(SessionError::BrowserNotFound)?;
        tracing::info!("detected browser: {}", path.display());
        Ok(path)
    }

    /// Install cookies into the active context. No-op with a warning when no
    /// context is active.
    pub async fn add_cookies(&self, cookies: &[Cookie]) {
        let Some(context) = &self.context else {
            tracing::warn!("add_cookies called without an active browsing context");
            return;
        };
        match context.add_cookies(cookies).await {
            Ok(()) => tracing::info!("added {} cookie(s)", cookies.len()),
            Err(e) => tracing::warn!("adding cookies failed: {}", e),
        }
    }

    /// Snapshot of the active context's cookie jar; empty (with a warning)
    /// when no context is active or the read fails.
    pub async fn get_cookies(&self) -> Vec<Cookie> {
        let Some(context) = &self.context else {
            tracing::warn!("get_cookies called without an active browsing context");
            return Vec::new();
        };
        match context.cookies().await {
            Ok(cookies) => cookies,
            Err(e) => {
                tracing::warn!("reading cookies failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Register a startup script (e.g. an anti-detection payload) on every
    /// live page of the active context. Missing files and missing contexts
    /// are logged no-ops.
    pub async fn inject_startup_script(&self, path: &std::path::Path) {
        let Some(context) = &self.context else {
            tracing::warn!("inject_startup_script called without an active browsing context");
            return;
        };
        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("startup script {} unreadable: {}", path.display(), e);
                return;
            }
        };
        match context.add_init_script(&source).await {
            Ok(pages) => {
                tracing::info!(
                    "registered startup script {} on {} page(s)",
                    path.display(),
                    pages
                )
            }
            Err(e) => tracing::warn!("registering startup script failed: {}", e),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.controller.as_ref().is_some_and(Controller::is_connected)
    }

    /// Degrades to defaults when disconnected rather than failing.
    pub async fn describe(&self) -> SessionInfo {
        let mut info = SessionInfo {
            version: None,
            context_count: 0,
            debug_port: self.config.debug_port,
            connected: self.is_connected(),
        };

        if let Some(controller) = &self.controller {
            match controller.version().await {
                Ok(version) => info.version = Some(version),
                Err(e) => tracing::warn!("fetching browser version failed: {}", e),
            }
            match controller.contexts().await {
                Ok(contexts) => info.context_count = contexts.len(),
                Err(e) => tracing::warn!("listing contexts failed: {}", e),
            }
        }

        info
    }

    /// Ordered teardown: context, then controller, then (optionally) the
    /// process. Each step proceeds regardless of earlier failures; the
    /// report carries the non-fatal diagnostics. Idempotent, never raises.
    pub async fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(context) = self.context.take() {
            if let Err(e) = context.close().await {
                let issue = format!("closing browsing context failed: {}", e);
                tracing::warn!("{}", issue);
                report.issues.push(issue);
            }
        }

        if let Some(controller) = self.controller.take() {
            if let Err(e) = controller.close().await {
                let issue = format!("closing CDP connection failed: {}", e);
                tracing::warn!("{}", issue);
                report.issues.push(issue);
            }
        }

        if self.config.auto_close_on_cleanup {
            self.launcher.terminate().await;
        } else {
            tracing::info!("leaving browser process running (auto_close_on_cleanup=false)");
        }

        self.event_bus.publish(SessionEvent::CleanupFinished);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ProcessHandle;
    use crate::probe::tests::endpoint_for;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records calls; never spawns anything.
    struct MockLauncher {
        candidates: Vec<PathBuf>,
        launches: Arc<AtomicUsize>,
        terminates: Arc<AtomicUsize>,
    }

    impl MockLauncher {
        fn new(candidates: Vec<PathBuf>) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let launches = Arc::new(AtomicUsize::new(0));
            let terminates = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    candidates,
                    launches: launches.clone(),
                    terminates: terminates.clone(),
                },
                launches,
                terminates,
            )
        }
    }

    #[async_trait]
    impl ProcessLauncher for MockLauncher {
        fn detect_candidate_paths(&self) -> Vec<PathBuf> {
            self.candidates.clone()
        }

        async fn launch(
            &mut self,
            _path: &Path,
            _port: u16,
            _headless: bool,
            _profile_dir: Option<&Path>,
        ) -> std::io::Result<ProcessHandle> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessHandle { pid: Some(4242) })
        }

        async fn wait_until_ready(&self, _port: u16, _timeout: Duration) -> bool {
            false
        }

        async fn terminate(&mut self) {
            self.terminates.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config(endpoint: &Endpoint) -> SessionConfig {
        SessionConfig {
            host: endpoint.host.clone(),
            debug_port: endpoint.port,
            save_login_state: false,
            launch_timeout: Duration::from_millis(300),
            ..SessionConfig::default()
        }
    }

    fn dead_endpoint() -> Endpoint {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn ready_port_skips_launch_entirely() {
        // Metadata answers but the advertised WebSocket target is dead, so
        // the acquire fails at CONNECTING - after skipping the launch step.
        let ws_port = dead_endpoint().port;
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/json/version")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "webSocketDebuggerUrl":
                        format!("ws://127.0.0.1:{}/devtools/browser/abc", ws_port)
                })
                .to_string(),
            )
            .expect_at_least(1)
            .create_async()
            .await;

        let endpoint = endpoint_for(&server);
        let (launcher, launches, terminates) =
            MockLauncher::new(vec![PathBuf::from("/detected/chromium")]);
        let mut manager = CDPBrowserManager::new(test_config(&endpoint), Box::new(launcher));
        let mut events = manager.event_bus.subscribe();

        let err = manager.acquire(None, None, true).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection { .. }));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
        assert_eq!(terminates.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), SessionState::Failed);

        match events.try_recv() {
            Ok(SessionEvent::ProbeSucceeded { port }) => assert_eq!(port, endpoint.port),
            other => panic!("expected ProbeSucceeded first, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn never_ready_port_times_out_without_terminate() {
        let endpoint = dead_endpoint();
        let (launcher, launches, terminates) =
            MockLauncher::new(vec![PathBuf::from("/detected/chromium")]);
        let mut manager = CDPBrowserManager::new(test_config(&endpoint), Box::new(launcher));

        let err = manager.acquire(None, None, true).await.unwrap_err();
        assert!(matches!(err, SessionError::LaunchTimeout { .. }));
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        // The process is left for the caller's cleanup policy.
        assert_eq!(terminates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nonexistent_custom_path_falls_through_to_detection() {
        let (launcher, _, _) = MockLauncher::new(vec![PathBuf::from("/detected/chromium")]);
        let config = SessionConfig {
            custom_browser_path: Some(PathBuf::from("/definitely/not/a/browser")),
            ..SessionConfig::default()
        };
        let manager = CDPBrowserManager::new(config, Box::new(launcher));

        let path = manager.resolve_browser_path().unwrap();
        assert_eq!(path, PathBuf::from("/detected/chromium"));
    }

    #[tokio::test]
    async fn no_browser_anywhere_is_an_error() {
        let (launcher, _, _) = MockLauncher::new(Vec::new());
        let manager = CDPBrowserManager::new(SessionConfig::default(), Box::new(launcher));

        let err = manager.resolve_browser_path().unwrap_err();
        assert!(matches!(err, SessionError::BrowserNotFound));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_safe_before_init() {
        let (launcher, _, terminates) = MockLauncher::new(Vec::new());
        let config = SessionConfig {
            auto_close_on_cleanup: true,
            ..SessionConfig::default()
        };
        let mut manager = CDPBrowserManager::new(config, Box::new(launcher));

        let first = manager.cleanup().await;
        let second = manager.cleanup().await;
        assert!(first.issues.is_empty());
        assert!(second.issues.is_empty());
        // Termination is gated only by the config flag.
        assert_eq!(terminates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auxiliary_ops_are_noops_without_context() {
        let (launcher, _, _) = MockLauncher::new(Vec::new());
        let manager = CDPBrowserManager::new(SessionConfig::default(), Box::new(launcher));

        assert!(!manager.is_connected());
        assert!(manager.get_cookies().await.is_empty());
        manager.add_cookies(&[]).await;
        manager
            .inject_startup_script(Path::new("/no/such/stealth.js"))
            .await;

        let info = manager.describe().await;
        assert_eq!(info.version, None);
        assert_eq!(info.context_count, 0);
        assert!(!info.connected);
        assert_eq!(manager.state(), SessionState::Init);
    }

    #[test]
    fn profile_dir_is_keyed_by_platform() {
        let config = SessionConfig {
            save_login_state: true,
            user_data_root: PathBuf::from("browser_data"),
            platform: "xhs".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(
            config.profile_dir(),
            Some(PathBuf::from("browser_data").join("cdp_xhs"))
        );

        let disabled = SessionConfig {
            save_login_state: false,
            ..SessionConfig::default()
        };
        assert_eq!(disabled.profile_dir(), None);
    }

    #[tokio::test]
    #[ignore] // Needs running Chrome with --remote-debugging-port=9222
    async fn acquire_against_live_browser() {
        let (launcher, _, _) = MockLauncher::new(Vec::new());
        let mut manager = CDPBrowserManager::new(SessionConfig::default(), Box::new(launcher));

        let context = manager.acquire(None, None, true).await.unwrap();
        println!("context fresh: {}", context.is_fresh());
        println!("info: {:?}", manager.describe().await);

        manager.cleanup().await;
    }
}
