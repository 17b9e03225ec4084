//! The fetch pipeline: one browser session per request.

use std::sync::Arc;

use tokio::sync::watch;

use crate::cdp::CommandChannel;
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::intercept::InterceptListener;
use crate::launcher::{BrowserSession, ChromeLauncher, SessionLauncher};
use crate::navigation::{self, ROOT_SELECTOR};
use crate::profile::ProfileRoot;
use crate::request::{FetchRequest, FetchResponse};

/// Performs requests by driving a headless browser.
///
/// Every call to [`BrowserFetcher::fetch`] launches its own session, so a
/// single fetcher can serve concurrent calls.
pub struct BrowserFetcher {
    config: FetchConfig,
    launcher: Arc<dyn SessionLauncher>,
    profiles: Arc<ProfileRoot>,
}

impl BrowserFetcher {
    /// A fetcher that launches a local Chrome/Chromium per request.
    pub fn new(config: FetchConfig, profiles: Arc<ProfileRoot>) -> Self {
        let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));
        Self::with_launcher(config, profiles, launcher)
    }

    pub fn with_launcher(
        config: FetchConfig,
        profiles: Arc<ProfileRoot>,
        launcher: Arc<dyn SessionLauncher>,
    ) -> Self {
        Self {
            config,
            launcher,
            profiles,
        }
    }

    /// Perform one request.
    ///
    /// Returns a response only if navigation, the ready wait and HTML
    /// extraction all succeed. Once a session is launched it is stopped
    /// exactly once, whatever the outcome.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let request = Arc::new(request);
        let mut session = self.launcher.launch(&self.profiles).await?;

        let outcome = self.drive(session.as_mut(), &request).await;
        session.stop().await;

        match &outcome {
            Ok(resp) => tracing::info!(url = request.url(), status = ?resp.status, "fetch complete"),
            Err(e) => tracing::warn!(url = request.url(), error = %e, "fetch failed"),
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        request: &Arc<FetchRequest>,
    ) -> Result<FetchResponse, FetchError> {
        let commands = session.commands();
        let events = session
            .take_events()
            .ok_or_else(|| FetchError::protocol("session event feed already taken"))?;

        navigation::enable_instrumentation(commands.as_ref(), self.config.command_timeout())
            .await?;

        let listener = InterceptListener::spawn(
            events,
            Arc::clone(&commands),
            Arc::clone(request),
            self.config.intercept_command_timeout(),
        );

        let mut loaded = listener.load_signal();
        let rendered = self.render(commands.as_ref(), request, &mut loaded).await;
        let correlator = listener.stop().await;
        let body = rendered?;

        let captured = correlator.into_captured();
        if captured.is_none() {
            tracing::warn!(url = request.url(), "no response event matched the navigation request");
        }
        let (status, headers) = match captured {
            Some(c) => (Some(c.status), c.headers),
            None => (None, Default::default()),
        };

        Ok(FetchResponse {
            status,
            url: request.url().to_string(),
            headers,
            body,
        })
    }

    /// Navigate and wait for the load event, wait for the document root,
    /// serialize.
    async fn render(
        &self,
        commands: &dyn CommandChannel,
        request: &FetchRequest,
        loaded: &mut watch::Receiver<bool>,
    ) -> Result<String, FetchError> {
        let deadline = request
            .navigation_timeout()
            .unwrap_or_else(|| self.config.navigation_timeout());

        navigation::navigate(commands, request.url(), deadline, loaded).await?;
        navigation::wait_ready(
            commands,
            ROOT_SELECTOR,
            self.config.ready_timeout(),
            self.config.ready_poll_interval(),
            self.config.command_timeout(),
        )
        .await?;
        navigation::document_html(commands, self.config.command_timeout()).await
    }
}
