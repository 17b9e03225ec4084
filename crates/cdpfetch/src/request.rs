//! Caller-facing request and response values.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Serialize;
use url::Url;

use crate::error::FetchError;

/// Methods whose body is forwarded as post data when intercepted.
const BODY_METHODS: &[&str] = &["POST", "PUT", "DELETE"];

/// A single browser-driven fetch, as the caller intends it.
///
/// Built once and never mutated while a fetch is in flight; interception
/// tasks share it through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body: Option<Vec<u8>>,
    navigation_timeout: Option<Duration>,
}

impl FetchRequest {
    /// Create a request for `url` with the given method.
    ///
    /// The URL must be absolute. The method is uppercased; anything other
    /// than GET/POST/PUT/DELETE is passed to the browser as-is.
    pub fn new(method: &str, url: &str) -> Result<Self, FetchError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(FetchError::InvalidRequest {
                reason: "url must not be empty".to_string(),
            });
        }
        Url::parse(url).map_err(|e| FetchError::InvalidRequest {
            reason: format!("url `{url}` is not absolute: {e}"),
        })?;

        let method = method.trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(FetchError::InvalidRequest {
                reason: "method must not be empty".to_string(),
            });
        }

        Ok(Self {
            url: url.to_string(),
            method,
            headers: HashMap::new(),
            body: None,
            navigation_timeout: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, FetchError> {
        Self::new("GET", url)
    }

    pub fn post(url: &str) -> Result<Self, FetchError> {
        Self::new("POST", url)
    }

    /// Add a header. Supplying any header replaces the browser's outgoing
    /// header set entirely.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Attach a body. Rejected for GET and HEAD.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Result<Self, FetchError> {
        if matches!(self.method.as_str(), "GET" | "HEAD") {
            return Err(FetchError::InvalidRequest {
                reason: format!("{} requests cannot carry a body", self.method),
            });
        }
        self.body = Some(body.into());
        Ok(self)
    }

    /// Override the configured navigation deadline for this request only.
    #[must_use]
    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn navigation_timeout(&self) -> Option<Duration> {
        self.navigation_timeout
    }

    /// Body to send as `postData`, base64-encoded, if the method carries one.
    pub fn encoded_post_data(&self) -> Option<String> {
        if !BODY_METHODS.contains(&self.method.as_str()) {
            return None;
        }
        self.body
            .as_deref()
            .filter(|b| !b.is_empty())
            .map(|b| B64.encode(b))
    }
}

/// Outcome of a successful browser-driven fetch.
///
/// `status` and `headers` come from the network response matched to the
/// primary navigation; when no response event matched they are `None` and
/// empty while `body` still holds the rendered document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResponse {
    pub status: Option<u16>,
    /// Always the request URL, never the post-redirect URL.
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Outer HTML of the rendered document.
    pub body: String,
}
