//! Browser session acquisition over CDP
//!
//! Given a debuggable Chrome/Edge instance - already running, or launched on
//! demand through an external [`launcher::ProcessLauncher`] - this crate
//! establishes one authoritative CDP connection and hands back a working
//! browsing context that preserves pre-existing authentication state
//! (cookies) wherever possible.
//!
//! Three startup topologies hide behind one call:
//! 1. a browser is already listening on the debug port (attach, reuse its
//!    context and login state),
//! 2. a browser was launched but its DevTools server is still coming up
//!    (bounded readiness polling),
//! 3. a fresh browser with no session history (create a context and federate
//!    cookies from whatever live tabs the process reports).
//!
//! Page-level automation is out of scope - the flow ends once a usable
//! [`context::BrowsingContext`] is handed back.

pub mod cdp;
pub mod context;
pub mod controller;
pub mod cookies;
pub mod error;
pub mod events;
pub mod launcher;
pub mod probe;
pub mod session;

pub use cdp::{CDPClient, CDPSession};
pub use context::{BrowsingContext, ContextOptions};
pub use controller::Controller;
pub use cookies::{Cookie, CookieFederator, FederationReport};
pub use error::{ProbeError, SessionError};
pub use events::{EventBus, SessionEvent};
pub use launcher::{ProcessHandle, ProcessLauncher};
pub use probe::{Endpoint, ReadinessProbe};
pub use session::{
    CDPBrowserManager, CleanupReport, ProxyConfig, SessionConfig, SessionInfo, SessionState,
};
