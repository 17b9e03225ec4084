//! The crate-wide error type.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while performing a browser-driven fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The browser process could not be started or never exposed a
    /// DevTools page target.
    #[error("failed to launch browser: {reason}")]
    LaunchFailed { reason: String },

    /// The page target's WebSocket could not be opened.
    #[error("cannot attach to DevTools endpoint {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The browser answered a command with an `error` object.
    #[error("CDP error {code}: {message}")]
    CdpError {
        code: i64,
        message: String,
        data: Option<String>,
    },

    /// No reply arrived within the command deadline.
    #[error("no reply to {method} within {duration:?}")]
    Timeout { method: String, duration: Duration },

    /// Malformed or missing data on the DevTools connection.
    #[error("DevTools protocol error: {detail}")]
    Protocol { detail: String },

    /// Enabling the `Network` or `Fetch` domain failed before navigation.
    #[error("failed to enable {capability} instrumentation: {reason}")]
    InstrumentationFailed { capability: String, reason: String },

    /// The navigation command did not complete within its deadline.
    #[error("navigation to {url} timed out after {duration:?}")]
    NavigationTimeout { url: String, duration: Duration },

    /// Navigation failed (e.g. `net::ERR_NAME_NOT_RESOLVED`).
    #[error("navigation failed: {reason}")]
    NavigationFailed { reason: String },

    /// The document root never became available.
    #[error("document not ready: {reason}")]
    DocumentNotReady { reason: String },

    /// Serializing the rendered document failed.
    #[error("failed to extract document HTML: {reason}")]
    ExtractionFailed { reason: String },

    /// The caller's request is malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Shorthand for a [`FetchError::Protocol`] error.
    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        FetchError::Protocol {
            detail: detail.into(),
        }
    }
}
