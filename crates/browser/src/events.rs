//! Event Bus - Simple event system for session lifecycle milestones
//!
//! Design: Type-safe events with async handlers.
//! No dynamic dispatch overhead - use enums, not trait objects.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Milestones of a session acquisition, published as they happen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The debug port answered the readiness probe; attaching to it.
    ProbeSucceeded { port: u16 },
    /// Nothing on the debug port; a browser process is being launched.
    LaunchRequested { path: String },
    /// CDP handshake completed.
    Connected { ws_url: String },
    /// A pre-existing browsing context was adopted.
    ContextReused { pages: usize },
    /// No context existed; a fresh one was created.
    ContextCreated,
    /// Cookie federation finished for a fresh context.
    CookiesFederated { installed: usize },
    /// Ordered teardown ran to completion.
    CleanupFinished,
}

/// Simple event bus using tokio broadcast channel
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event); // Ignore error if no subscribers
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
