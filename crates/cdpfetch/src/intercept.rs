//! Request interception and response correlation.
//!
//! One [`InterceptListener`] runs per fetch. It consumes the session's event
//! feed and:
//!
//! - tracks the request believed to be the top-level navigation
//!   (`Network.requestWillBeSent` with an http(s) URL and no `Referer`),
//! - captures status and headers from the `Network.responseReceived` event
//!   carrying the tracked id,
//! - answers every `Fetch.requestPaused` with exactly one of
//!   `Fetch.failRequest` (images and unclassified resources) or
//!   `Fetch.continueRequest` rewritten with the caller's method, headers and
//!   body,
//! - raises the load signal on `Page.loadEventFired`.
//!
//! The rewrite applies to every continued request, not only the tracked
//! navigation: subresources that pass the filter also carry the caller's
//! method, headers and body. Pages whose navigation request does carry a
//! `Referer` never get their response captured.
//!
//! Interception commands run as tasks on a [`JoinSet`] so the event loop
//! never waits on them. Their errors are logged and dropped; only the
//! navigation itself can fail a fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use url::Url;

use crate::cdp::{CdpEvent, CommandChannel, EventReceiver};
use crate::error::FetchError;
use crate::events::{NetworkEvent, RequestId, ResourceType};
use crate::request::FetchRequest;

/// `Network.ErrorReason` sent for blocked requests.
pub const BLOCKED_REASON: &str = "BlockedByClient";

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Where the correlator is in a single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    /// No navigation candidate seen yet.
    Idle,
    /// A request id is tracked but no matching response has arrived.
    TrackingSet,
    /// The tracked request's response metadata has been captured.
    ResponseCaptured,
}

/// Response metadata captured from `Network.responseReceived`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// Correlates the primary navigation's request with its response.
#[derive(Debug, Default)]
pub struct Correlator {
    tracked: Option<RequestId>,
    captured: Option<CapturedResponse>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CorrelationState {
        match (&self.tracked, &self.captured) {
            (_, Some(_)) => CorrelationState::ResponseCaptured,
            (Some(_), None) => CorrelationState::TrackingSet,
            (None, None) => CorrelationState::Idle,
        }
    }

    pub fn tracked(&self) -> Option<&RequestId> {
        self.tracked.as_ref()
    }

    pub fn captured(&self) -> Option<&CapturedResponse> {
        self.captured.as_ref()
    }

    pub fn into_captured(self) -> Option<CapturedResponse> {
        self.captured
    }

    /// Feed a `Network.requestWillBeSent`. Returns true if `id` is now tracked.
    ///
    /// Every qualifying request overwrites the tracked id; the last one wins.
    pub fn observe_request(
        &mut self,
        id: &RequestId,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> bool {
        if !is_navigation_candidate(url, headers) {
            return false;
        }
        tracing::debug!(request_id = %id, url = url, "tracking navigation request");
        self.tracked = Some(id.clone());
        true
    }

    /// Feed a `Network.responseReceived`. Returns true if it was captured.
    pub fn observe_response(
        &mut self,
        id: &RequestId,
        status: u16,
        headers: &HashMap<String, String>,
    ) -> bool {
        if self.tracked.as_ref() != Some(id) {
            return false;
        }
        tracing::debug!(request_id = %id, status = status, "captured navigation response");
        self.captured = Some(CapturedResponse {
            status,
            headers: headers.clone(),
        });
        true
    }
}

/// An http(s) request without a `Referer` header is taken to be the
/// top-level navigation rather than a subresource.
pub fn is_navigation_candidate(url: &str, headers: &HashMap<String, String>) -> bool {
    let http_scheme = Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    let has_referer = headers.keys().any(|k| k.eq_ignore_ascii_case("referer"));
    http_scheme && !has_referer
}

// ---------------------------------------------------------------------------
// Interception policy
// ---------------------------------------------------------------------------

/// One `Fetch.HeaderEntry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// Parameters for `Fetch.continueRequest` beyond the request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueParams {
    pub method: String,
    /// `None` keeps the browser's headers; `Some` replaces them entirely.
    pub headers: Option<Vec<HeaderEntry>>,
    /// Base64-encoded body.
    pub post_data: Option<String>,
}

/// What to do with a paused request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    Block,
    Continue(ContinueParams),
}

impl InterceptDecision {
    /// The CDP command that carries out this decision for request `id`.
    pub fn to_command(&self, id: &RequestId) -> (&'static str, Value) {
        match self {
            InterceptDecision::Block => (
                "Fetch.failRequest",
                serde_json::json!({
                    "requestId": id.0,
                    "errorReason": BLOCKED_REASON,
                }),
            ),
            InterceptDecision::Continue(params) => {
                let mut body = serde_json::json!({
                    "requestId": id.0,
                    "method": params.method,
                });
                if let Some(headers) = &params.headers {
                    body["headers"] = serde_json::json!(headers);
                }
                if let Some(post_data) = &params.post_data {
                    body["postData"] = Value::String(post_data.clone());
                }
                ("Fetch.continueRequest", body)
            }
        }
    }
}

/// Decide how to answer a paused request.
///
/// Depends only on the resource type and the caller's request, never on
/// correlation state.
pub fn decide(request: &FetchRequest, resource_type: ResourceType) -> InterceptDecision {
    if resource_type.is_blocked() {
        return InterceptDecision::Block;
    }

    let headers = if request.headers().is_empty() {
        None
    } else {
        let mut entries: Vec<HeaderEntry> = request
            .headers()
            .iter()
            .map(|(name, value)| HeaderEntry {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Some(entries)
    };

    InterceptDecision::Continue(ContinueParams {
        method: request.method().to_string(),
        headers,
        post_data: request.encoded_post_data(),
    })
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

type TaskOutcome = (RequestId, Result<(), FetchError>);

/// Background task reacting to one session's network events.
pub struct InterceptListener {
    shutdown: Option<oneshot::Sender<()>>,
    loaded: watch::Receiver<bool>,
    handle: JoinHandle<Correlator>,
}

impl InterceptListener {
    /// Start listening. Must be spawned before navigation begins, since the
    /// navigation request itself is paused until this listener answers it.
    pub fn spawn(
        events: EventReceiver,
        commands: Arc<dyn CommandChannel>,
        request: Arc<FetchRequest>,
        command_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let handle = tokio::spawn(run_listener(
            events,
            Interceptor {
                commands,
                request,
                command_timeout,
                correlator: Correlator::new(),
                tasks: JoinSet::new(),
                loaded: loaded_tx,
            },
            shutdown_rx,
        ));
        Self {
            shutdown: Some(shutdown_tx),
            loaded: loaded_rx,
            handle,
        }
    }

    /// Flips to `true` once `Page.loadEventFired` has been seen. The sender
    /// is dropped when the listener exits.
    pub fn load_signal(&self) -> watch::Receiver<bool> {
        self.loaded.clone()
    }

    /// Stop the listener and return the final correlation.
    ///
    /// Events queued before the call are still processed; the feed is closed
    /// to anything later. Then every interception task is joined, so nothing
    /// spawned for this session outlives it.
    pub async fn stop(mut self) -> Correlator {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.handle).await {
            Ok(correlator) => correlator,
            Err(e) => {
                tracing::warn!(error = %e, "interception listener failed");
                Correlator::new()
            }
        }
    }
}

impl Drop for InterceptListener {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.handle.abort();
        }
    }
}

/// State owned by the listener task.
struct Interceptor {
    commands: Arc<dyn CommandChannel>,
    request: Arc<FetchRequest>,
    command_timeout: Duration,
    correlator: Correlator,
    tasks: JoinSet<TaskOutcome>,
    loaded: watch::Sender<bool>,
}

impl Interceptor {
    fn handle(&mut self, raw: &CdpEvent) {
        match NetworkEvent::from_cdp(raw) {
            NetworkEvent::RequestWillBeSent { id, url, headers } => {
                self.correlator.observe_request(&id, &url, &headers);
            }
            NetworkEvent::ResponseReceived { id, status, headers } => {
                self.correlator.observe_response(&id, status, &headers);
            }
            NetworkEvent::RequestPaused { id, url, resource_type } => {
                let decision = decide(&self.request, resource_type);
                tracing::debug!(
                    request_id = %id,
                    url = %url,
                    resource_type = ?resource_type,
                    blocked = matches!(decision, InterceptDecision::Block),
                    "intercepted request"
                );
                let commands = Arc::clone(&self.commands);
                let timeout = self.command_timeout;
                self.tasks.spawn(async move {
                    let (method, params) = decision.to_command(&id);
                    let result = commands
                        .send_command(method, params, timeout)
                        .await
                        .map(|_| ());
                    (id, result)
                });
            }
            NetworkEvent::PageLoaded => {
                tracing::debug!("page load event fired");
                self.loaded.send_replace(true);
            }
            NetworkEvent::Ignored => {}
        }
    }

    async fn finish(mut self) -> Correlator {
        while let Some(joined) = self.tasks.join_next().await {
            log_task_outcome(joined);
        }
        self.correlator
    }
}

async fn run_listener(
    mut events: EventReceiver,
    mut state: Interceptor,
    mut shutdown: oneshot::Receiver<()>,
) -> Correlator {
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                // Bounded drain: only what is already buffered.
                events.close();
                while let Some(raw) = events.recv().await {
                    state.handle(&raw);
                }
                break;
            }
            maybe_event = events.recv() => {
                let Some(raw) = maybe_event else {
                    tracing::debug!("event feed closed");
                    break;
                };
                state.handle(&raw);
            }
            Some(joined) = state.tasks.join_next(), if !state.tasks.is_empty() => {
                log_task_outcome(joined);
            }
        }
    }

    state.finish().await
}

fn log_task_outcome(joined: Result<TaskOutcome, JoinError>) {
    match joined {
        Ok((_, Ok(()))) => {}
        Ok((id, Err(e))) => {
            tracing::debug!(request_id = %id, error = %e, "interception command failed, ignoring");
        }
        Err(e) => {
            tracing::debug!(error = %e, "interception task aborted");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
