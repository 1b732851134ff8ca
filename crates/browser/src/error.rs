//! Error types for session acquisition
//!
//! Simple, flat error hierarchy. Probe failures are expected signals and stay
//! internal; launch and connection failures are fatal and keep their cause.

use std::time::Duration;
use thiserror::Error;

use crate::cdp::client::CDPError;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Failure of a metadata request against the debug endpoint. Expected during
/// probing (the browser may simply not be there) - callers convert it to a
/// boolean signal or escalate it as the source of a `SessionError`.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser did not become ready on port {port} within {timeout:?}")]
    LaunchTimeout { port: u16, timeout: Duration },

    #[error("connection failed: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("browser refused context creation")]
    ContextCreation(#[source] CDPError),

    #[error(
        "no usable browser found; install Chrome/Edge or set custom_browser_path in the config"
    )]
    BrowserNotFound,

    #[error("browser process failed to start")]
    Spawn(#[source] std::io::Error),
}

impl SessionError {
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn connection_with(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_keeps_root_cause() {
        let inner = CDPError::Protocol {
            code: -32000,
            message: "no such target".to_string(),
        };
        let err = SessionError::connection_with("handshake failed", inner);

        assert!(err.to_string().contains("handshake failed"));
        let source = std::error::Error::source(&err).expect("cause attached");
        assert!(source.to_string().contains("no such target"));
    }

    #[test]
    fn launch_timeout_names_port_and_ceiling() {
        let err = SessionError::LaunchTimeout {
            port: 9222,
            timeout: Duration::from_secs(30),
        };
        let text = err.to_string();
        assert!(text.contains("9222"));
        assert!(text.contains("30"));
    }
}
