//! Perform HTTP-style requests through a headless Chrome/Chromium.
//!
//! Instead of speaking HTTP itself, this crate launches a browser per
//! request, steers it over the Chrome DevTools Protocol, and returns the
//! response status and headers together with the rendered document.
//!
//! For each request:
//!
//! - a fresh browser is launched with an isolated profile directory
//! - `Network` and `Fetch` instrumentation is enabled
//! - every outgoing request is paused: images and unclassified resources are
//!   failed, everything else continues with the caller's method, headers and
//!   body
//! - the top-level navigation's response is matched back to the request
//! - after navigation the `:root` element is awaited and the document's
//!   outer HTML becomes the response body
//! - the browser is stopped, whatever happened
//!
//! # Architecture
//!
//! - **`cdp`**: WebSocket client with command/response correlation and an
//!   event feed, behind the [`CommandChannel`] trait.
//! - **`launcher`**: spawns Chrome and attaches to its page target
//!   ([`SessionLauncher`], [`BrowserSession`]).
//! - **`events`** / **`intercept`**: typed network events, the correlation
//!   state machine, and the interception listener.
//! - **`navigation`**: enable, navigate, wait ready, extract.
//! - **`fetcher`**: ties the steps together in [`BrowserFetcher`].
//!
//! # Example (conceptual)
//!
//! ```ignore
//! use std::sync::Arc;
//! use cdpfetch::{BrowserFetcher, FetchConfig, FetchRequest, ProfileRoot};
//!
//! let profiles = Arc::new(ProfileRoot::temporary()?);
//! let fetcher = BrowserFetcher::new(FetchConfig::default(), profiles);
//! let request = FetchRequest::post("https://httpbin.org/post")?
//!     .with_header("Content-Type", "application/json; charset=utf-8")
//!     .with_body(r#"{"test":"testdata"}"#)?;
//! let response = fetcher.fetch(request).await?;
//! println!("{:?} {}", response.status, response.body);
//! ```

pub mod cdp;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod intercept;
pub mod launcher;
pub mod navigation;
pub mod profile;
pub mod request;

pub use cdp::{CdpClient, CdpEvent, CommandChannel, EventReceiver};
pub use config::{BrowserConfig, FetchConfig};
pub use error::FetchError;
pub use events::{NetworkEvent, RequestId, ResourceType};
pub use fetcher::BrowserFetcher;
pub use intercept::{CorrelationState, Correlator, InterceptDecision};
pub use launcher::{BrowserSession, ChromeLauncher, SessionLauncher};
pub use profile::ProfileRoot;
pub use request::{FetchRequest, FetchResponse};
