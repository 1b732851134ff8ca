//! Process launcher seam
//!
//! Binary detection and OS process management live outside this crate; the
//! session manager only consumes this interface. Implementations come from
//! the embedding tool (and from recording mocks in tests).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

/// Opaque handle to a launched browser process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
}

/// Detects installed browser binaries and owns the spawned process.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Candidate browser binaries, in preference order.
    fn detect_candidate_paths(&self) -> Vec<PathBuf>;

    /// Spawn the browser with remote debugging enabled on `port`.
    async fn launch(
        &mut self,
        path: &Path,
        port: u16,
        headless: bool,
        profile_dir: Option<&Path>,
    ) -> std::io::Result<ProcessHandle>;

    /// Block until the debug port answers, up to `timeout`.
    async fn wait_until_ready(&self, port: u16, timeout: Duration) -> bool;

    /// Kill the process this launcher spawned, if any.
    async fn terminate(&mut self);
}
