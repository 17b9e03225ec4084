//! Typed view over the CDP events a fetch reacts to.
//!
//! Raw [`CdpEvent`]s are decoded into [`NetworkEvent`]; every other method
//! name, and any event whose params fail to decode, becomes
//! [`NetworkEvent::Ignored`].

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::cdp::CdpEvent;

pub const REQUEST_WILL_BE_SENT: &str = "Network.requestWillBeSent";
pub const RESPONSE_RECEIVED: &str = "Network.responseReceived";
pub const REQUEST_PAUSED: &str = "Fetch.requestPaused";
pub const LOAD_EVENT_FIRED: &str = "Page.loadEventFired";

/// Identifier of a request as reported by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Browser classification of a requested resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    TextTrack,
    #[serde(rename = "XHR")]
    Xhr,
    Fetch,
    Prefetch,
    EventSource,
    WebSocket,
    Manifest,
    SignedExchange,
    Ping,
    #[serde(rename = "CSPViolationReport")]
    CspViolationReport,
    Preflight,
    Other,
    /// A type this crate does not know about yet.
    #[serde(other)]
    Unrecognized,
}

impl ResourceType {
    /// Image and unclassified loads never reach the network.
    pub fn is_blocked(self) -> bool {
        matches!(self, ResourceType::Image | ResourceType::Other)
    }
}

/// A decoded network event.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    RequestWillBeSent {
        id: RequestId,
        url: String,
        headers: HashMap<String, String>,
    },
    ResponseReceived {
        id: RequestId,
        status: u16,
        headers: HashMap<String, String>,
    },
    RequestPaused {
        id: RequestId,
        url: String,
        resource_type: ResourceType,
    },
    /// The page's `load` event fired.
    PageLoaded,
    Ignored,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSentParams {
    request_id: RequestId,
    request: WireRequest,
}

#[derive(Deserialize)]
struct WireRequest {
    url: String,
    #[serde(default)]
    headers: HashMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceivedParams {
    request_id: RequestId,
    response: WireResponse,
}

#[derive(Deserialize)]
struct WireResponse {
    status: f64,
    #[serde(default)]
    headers: HashMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestPausedParams {
    request_id: RequestId,
    request: WireRequest,
    resource_type: ResourceType,
}

impl NetworkEvent {
    /// Decode a raw CDP event.
    pub fn from_cdp(event: &CdpEvent) -> Self {
        let decoded = match event.method.as_str() {
            REQUEST_WILL_BE_SENT => {
                serde_json::from_value::<RequestWillBeSentParams>(event.params.clone()).map(|p| {
                    NetworkEvent::RequestWillBeSent {
                        id: p.request_id,
                        url: p.request.url,
                        headers: flatten_headers(p.request.headers),
                    }
                })
            }
            RESPONSE_RECEIVED => {
                serde_json::from_value::<ResponseReceivedParams>(event.params.clone()).map(|p| {
                    NetworkEvent::ResponseReceived {
                        id: p.request_id,
                        status: status_code(p.response.status),
                        headers: flatten_headers(p.response.headers),
                    }
                })
            }
            REQUEST_PAUSED => {
                serde_json::from_value::<RequestPausedParams>(event.params.clone()).map(|p| {
                    NetworkEvent::RequestPaused {
                        id: p.request_id,
                        url: p.request.url,
                        resource_type: p.resource_type,
                    }
                })
            }
            LOAD_EVENT_FIRED => return NetworkEvent::PageLoaded,
            _ => return NetworkEvent::Ignored,
        };

        decoded.unwrap_or_else(|e| {
            tracing::debug!(method = %event.method, error = %e, "ignoring malformed network event");
            NetworkEvent::Ignored
        })
    }
}

/// CDP reports header values as strings, but tolerate anything.
fn flatten_headers(raw: HashMap<String, Value>) -> HashMap<String, String> {
    raw.into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect()
}

fn status_code(raw: f64) -> u16 {
    if raw.is_finite() && (0.0..=f64::from(u16::MAX)).contains(&raw) {
        raw as u16
    } else {
        0
    }
}
