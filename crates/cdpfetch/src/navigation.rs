//! Instrumentation and navigation steps of a fetch.
//!
//! Each step issues CDP commands through a [`CommandChannel`] and maps its
//! failures onto a distinct [`FetchError`] kind.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::cdp::CommandChannel;
use crate::error::FetchError;

/// Selector awaited before the document is serialized.
pub const ROOT_SELECTOR: &str = ":root";

/// Opaque handle to a DOM node, as returned by CDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub i64);

// ---------------------------------------------------------------------------
// Instrumentation
// ---------------------------------------------------------------------------

/// Enable network event reporting, request interception and page lifecycle
/// events.
///
/// All three must succeed before navigation starts; there is no retry.
pub async fn enable_instrumentation(
    commands: &dyn CommandChannel,
    timeout: Duration,
) -> Result<(), FetchError> {
    for (capability, method, params) in [
        ("network", "Network.enable", serde_json::json!({})),
        ("fetch", "Fetch.enable", build_fetch_enable_params()),
        ("page", "Page.enable", serde_json::json!({})),
    ] {
        commands
            .send_command(method, params, timeout)
            .await
            .map_err(|e| FetchError::InstrumentationFailed {
                capability: capability.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(capability = capability, "instrumentation enabled");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

/// Navigate to `url` and wait for the page's load event, failing if both do
/// not happen within `deadline`.
///
/// `loaded` is the interception listener's load signal. With interception
/// on, `Page.navigate` only returns once the navigation request has been
/// answered, so the listener must already be running.
pub async fn navigate(
    commands: &dyn CommandChannel,
    url: &str,
    deadline: Duration,
    loaded: &mut watch::Receiver<bool>,
) -> Result<(), FetchError> {
    tracing::info!(url = url, timeout = ?deadline, "navigating");

    let timed_out = || FetchError::NavigationTimeout {
        url: url.to_string(),
        duration: deadline,
    };

    let steps = async {
        let result = commands
            .send_command("Page.navigate", build_navigate_params(url), deadline)
            .await
            .map_err(|e| match e {
                FetchError::Timeout { .. } => timed_out(),
                other => FetchError::NavigationFailed {
                    reason: other.to_string(),
                },
            })?;

        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(FetchError::NavigationFailed {
                reason: error_text.to_string(),
            });
        }
        tracing::debug!(url = url, "navigation committed, waiting for load");

        loaded
            .wait_for(|l| *l)
            .await
            .map_err(|_| FetchError::NavigationFailed {
                reason: "event feed closed before the page loaded".to_string(),
            })?;
        Ok::<(), FetchError>(())
    };

    tokio::time::timeout(deadline, steps)
        .await
        .map_err(|_| timed_out())?
}

// ---------------------------------------------------------------------------
// DOM
// ---------------------------------------------------------------------------

/// Get the document root node ID.
async fn get_document_root(
    commands: &dyn CommandChannel,
    timeout: Duration,
) -> Result<NodeId, FetchError> {
    let result = commands
        .send_command("DOM.getDocument", serde_json::json!({}), timeout)
        .await?;

    result
        .get("root")
        .and_then(|r| r.get("nodeId"))
        .and_then(|n| n.as_i64())
        .map(NodeId)
        .ok_or_else(|| FetchError::protocol("DOM.getDocument did not return a root nodeId"))
}

async fn query_selector(
    commands: &dyn CommandChannel,
    root: NodeId,
    selector: &str,
    timeout: Duration,
) -> Result<Option<NodeId>, FetchError> {
    let result = commands
        .send_command(
            "DOM.querySelector",
            build_query_selector_params(root.0, selector),
            timeout,
        )
        .await?;

    let node_id = result.get("nodeId").and_then(|n| n.as_i64()).unwrap_or(0);
    Ok((node_id != 0).then_some(NodeId(node_id)))
}

/// Poll until `selector` matches in the current document.
///
/// `timeout` bounds the whole wait; each command gets at most
/// `command_timeout` of what is left.
pub async fn wait_ready(
    commands: &dyn CommandChannel,
    selector: &str,
    timeout: Duration,
    poll_interval: Duration,
    command_timeout: Duration,
) -> Result<NodeId, FetchError> {
    let deadline = Instant::now() + timeout;
    let mut last_error: Option<String> = None;

    loop {
        let budget = || command_timeout.min(deadline.saturating_duration_since(Instant::now()));
        let attempt = async {
            let root = get_document_root(commands, budget()).await?;
            query_selector(commands, root, selector, budget()).await
        };
        match tokio::time::timeout_at(deadline, attempt).await {
            Ok(Ok(Some(node))) => return Ok(node),
            Ok(Ok(None)) | Err(_) => {}
            // The document is replaced during loading; node ids go stale.
            Ok(Err(e)) => last_error = Some(e.to_string()),
        }

        if Instant::now() + poll_interval >= deadline {
            let reason = match last_error {
                Some(e) => format!("`{selector}` not found within {timeout:?}: {e}"),
                None => format!("`{selector}` not found within {timeout:?}"),
            };
            return Err(FetchError::DocumentNotReady { reason });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Serialize the whole rendered document.
pub async fn document_html(
    commands: &dyn CommandChannel,
    timeout: Duration,
) -> Result<String, FetchError> {
    let extraction_failed = |e: FetchError| FetchError::ExtractionFailed {
        reason: e.to_string(),
    };

    let root = get_document_root(commands, timeout)
        .await
        .map_err(extraction_failed)?;

    let result = commands
        .send_command("DOM.getOuterHTML", build_outer_html_params(root.0), timeout)
        .await
        .map_err(extraction_failed)?;

    result
        .get("outerHTML")
        .and_then(|h| h.as_str())
        .map(|h| h.to_string())
        .ok_or_else(|| FetchError::ExtractionFailed {
            reason: "DOM.getOuterHTML did not return a string".to_string(),
        })
}

// ---------------------------------------------------------------------------
// CDP parameter builders
// ---------------------------------------------------------------------------

/// Build CDP `Fetch.enable` parameters: pause every request before it is sent.
pub fn build_fetch_enable_params() -> Value {
    serde_json::json!({
        "patterns": [{ "urlPattern": "*", "requestStage": "Request" }],
    })
}

/// Build CDP `Page.navigate` parameters.
pub fn build_navigate_params(url: &str) -> Value {
    serde_json::json!({ "url": url })
}

/// Build CDP `DOM.querySelector` parameters.
pub fn build_query_selector_params(root_node_id: i64, selector: &str) -> Value {
    serde_json::json!({
        "nodeId": root_node_id,
        "selector": selector,
    })
}

/// Build CDP `DOM.getOuterHTML` parameters.
pub fn build_outer_html_params(node_id: i64) -> Value {
    serde_json::json!({ "nodeId": node_id })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
