//! Session acquisition example - attach to a manually started browser
//!
//! Start Chrome first, e.g.:
//!   google-chrome --remote-debugging-port=9222

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use cdp_browser::launcher::{ProcessHandle, ProcessLauncher};
use cdp_browser::session::{CDPBrowserManager, SessionConfig};

/// This demo only attaches; launching stays with the embedding tool.
struct NoLaunch;

#[async_trait]
impl ProcessLauncher for NoLaunch {
    fn detect_candidate_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn launch(
        &mut self,
        _path: &Path,
        _port: u16,
        _headless: bool,
        _profile_dir: Option<&Path>,
    ) -> std::io::Result<ProcessHandle> {
        Err(std::io::Error::other("this demo does not launch browsers"))
    }

    async fn wait_until_ready(&self, _port: u16, _timeout: Duration) -> bool {
        false
    }

    async fn terminate(&mut self) {}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let config = SessionConfig::default();
    println!("Acquiring session {} on port {}", config.id, config.debug_port);

    let mut manager = CDPBrowserManager::new(config, Box::new(NoLaunch));

    // Subscribe to events before acquiring
    let mut event_rx = manager.event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            println!("📢 Event: {:?}", event);
        }
    });

    let context = manager.acquire(None, None, false).await?;
    println!(
        "✅ Context ready (fresh: {}, {} page(s))",
        context.is_fresh(),
        context.page_count()
    );

    let info = manager.describe().await;
    println!(
        "📍 Browser: {} - {} context(s), connected: {}",
        info.version.as_deref().unwrap_or("unknown"),
        info.context_count,
        info.connected
    );

    let cookies = manager.get_cookies().await;
    println!("🍪 {} cookie(s) in the active jar", cookies.len());

    let report = manager.cleanup().await;
    if report.issues.is_empty() {
        println!("🛑 Session closed cleanly");
    } else {
        println!("🛑 Session closed with issues: {:?}", report.issues);
    }

    Ok(())
}
