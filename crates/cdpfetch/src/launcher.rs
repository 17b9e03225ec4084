//! Browser session bootstrapping and teardown.
//!
//! [`ChromeLauncher`] spawns one Chrome/Chromium process per fetch with a
//! private profile directory and a loopback remote-debugging port, waits for
//! the DevTools endpoint to list a page target, and attaches a
//! [`CdpClient`] to it. The resulting [`ChromeSession`] is stopped exactly
//! once by the fetcher; dropping it without stopping still kills the process.

use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::cdp::{CdpClient, CommandChannel, EventReceiver};
use crate::config::BrowserConfig;
use crate::error::FetchError;
use crate::profile::{ProfileRoot, SessionProfile};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// One browser tab bound to a single fetch.
#[async_trait]
pub trait BrowserSession: Send {
    /// Channel for issuing CDP commands to the page.
    fn commands(&self) -> Arc<dyn CommandChannel>;

    /// The page's event feed. Yields `Some` only once.
    fn take_events(&mut self) -> Option<EventReceiver>;

    /// Stop the browser and release the session's resources.
    async fn stop(&mut self);
}

/// Produces fresh, isolated browser sessions.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, profiles: &ProfileRoot) -> Result<Box<dyn BrowserSession>, FetchError>;
}

// ---------------------------------------------------------------------------
// Launch arguments
// ---------------------------------------------------------------------------

/// Build the Chrome command line for one session.
pub fn launch_args(config: &BrowserConfig, port: u16, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={port}"),
        "--remote-debugging-address=127.0.0.1".to_string(),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-gpu".to_string(),
        "--blink-settings=imagesEnabled=false".to_string(),
        "--disable-extensions".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-session-crashed-bubble".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!(
            "--window-size={},{}",
            config.window_width, config.window_height
        ),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    for extra in &config.extra_args {
        if !extra.trim().is_empty() {
            args.push(extra.to_string());
        }
    }
    args.push("about:blank".to_string());
    args
}

/// Binaries to try, in order.
pub fn browser_binary_candidates(configured: Option<&Path>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(path) = configured {
        let path = path.to_string_lossy();
        if !path.trim().is_empty() {
            candidates.push(path.into_owned());
        }
    }

    #[cfg(target_os = "macos")]
    candidates.extend(
        [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    #[cfg(target_os = "windows")]
    candidates.extend(
        [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    candidates.extend(
        ["google-chrome", "chromium", "chromium-browser", "chrome"]
            .iter()
            .map(|s| s.to_string()),
    );
    candidates
}

fn pick_ephemeral_port() -> Result<u16, FetchError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Pick the first page target's WebSocket URL from a `/json/list` payload.
pub fn page_websocket_url(targets: &Value) -> Option<String> {
    targets.as_array()?.iter().find_map(|target| {
        if target.get("type").and_then(|t| t.as_str()) != Some("page") {
            return None;
        }
        target
            .get("webSocketDebuggerUrl")
            .and_then(|u| u.as_str())
            .map(|u| u.to_string())
    })
}

/// Delay between `/json/list` polls.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll a DevTools `/json/list` endpoint until it lists a page target.
///
/// Gives up when `exited` reports the browser gone or `timeout` elapses;
/// a request the browser accepts but never answers is cut off at the
/// deadline too.
async fn discover_page_target<F>(
    url: &str,
    timeout: Duration,
    mut exited: F,
) -> Result<String, FetchError>
where
    F: FnMut() -> Option<String>,
{
    let deadline = Instant::now() + timeout;
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FetchError::LaunchFailed {
            reason: format!("cannot build DevTools HTTP client: {e}"),
        })?;

    loop {
        if let Some(status) = exited() {
            return Err(FetchError::LaunchFailed {
                reason: format!("browser exited during startup ({status})"),
            });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let poll = async { http.get(url).send().await?.json::<Value>().await };
        match tokio::time::timeout(remaining, poll).await {
            Ok(Ok(targets)) => {
                if let Some(ws) = page_websocket_url(&targets) {
                    return Ok(ws);
                }
            }
            Ok(Err(e)) => tracing::debug!(url = url, error = %e, "DevTools endpoint not ready"),
            Err(_) => break,
        }
        tokio::time::sleep_until(deadline.min(Instant::now() + DISCOVERY_POLL_INTERVAL)).await;
    }

    Err(FetchError::LaunchFailed {
        reason: format!("timed out after {timeout:?} waiting for DevTools endpoint on {url}"),
    })
}

// ---------------------------------------------------------------------------
// ChromeLauncher
// ---------------------------------------------------------------------------

/// Launches a local Chrome/Chromium per session.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn spawn(&self, args: &[String]) -> Result<Child, FetchError> {
        let mut last_error = None;
        for candidate in browser_binary_candidates(self.config.binary_path.as_deref()) {
            let mut cmd = Command::new(&candidate);
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            match cmd.spawn() {
                Ok(child) => {
                    tracing::info!(binary = %candidate, pid = ?child.id(), "launched browser");
                    return Ok(child);
                }
                Err(e) => {
                    tracing::debug!(binary = %candidate, error = %e, "browser candidate failed");
                    last_error = Some(format!("{candidate}: {e}"));
                }
            }
        }
        Err(FetchError::LaunchFailed {
            reason: last_error.unwrap_or_else(|| "no candidates available".to_string()),
        })
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self, profiles: &ProfileRoot) -> Result<Box<dyn BrowserSession>, FetchError> {
        let profile = profiles.session_profile()?;
        let port = pick_ephemeral_port()?;
        let args = launch_args(&self.config, port, profile.path());

        let mut child = self.spawn(&args)?;

        let url = format!("http://127.0.0.1:{port}/json/list");
        let exited = || {
            child
                .try_wait()
                .ok()
                .flatten()
                .map(|status| status.to_string())
        };
        let discovered = discover_page_target(&url, self.config.startup_timeout(), exited).await;
        let ws_url = match discovered {
            Ok(ws) => ws,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let client = match CdpClient::connect(&ws_url).await {
            Ok(client) => client,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        Ok(Box::new(ChromeSession {
            client: Arc::new(client),
            child: Some(child),
            profile: Some(profile),
        }))
    }
}

// ---------------------------------------------------------------------------
// ChromeSession
// ---------------------------------------------------------------------------

/// A launched browser process with a CDP connection to its page.
pub struct ChromeSession {
    client: Arc<CdpClient>,
    child: Option<Child>,
    profile: Option<SessionProfile>,
}

#[async_trait]
impl BrowserSession for ChromeSession {
    fn commands(&self) -> Arc<dyn CommandChannel> {
        self.client.clone()
    }

    fn take_events(&mut self) -> Option<EventReceiver> {
        self.client.take_events()
    }

    async fn stop(&mut self) {
        self.client.close().await;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "browser already exited");
            }
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(status = %status, "browser stopped"),
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to reap browser process"),
                Err(_) => tracing::warn!("browser did not exit within 5s"),
            }
        }

        // Only after the process is gone, so Chrome is not writing into it.
        if let Some(profile) = self.profile.take() {
            tracing::debug!(path = %profile.path().display(), "removing session profile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    #[test]
    fn test_launch_args_defaults() {
        let config = BrowserConfig::default();
        let args = launch_args(&config, 9333, Path::new("/tmp/p/session-1"));

        for flag in [
            "--remote-debugging-port=9333",
            "--remote-debugging-address=127.0.0.1",
            "--user-data-dir=/tmp/p/session-1",
            "--headless=new",
            "--disable-gpu",
            "--no-first-run",
            "--no-default-browser-check",
            "--blink-settings=imagesEnabled=false",
            "--disable-extensions",
            "--ignore-certificate-errors",
            "--window-size=1,1",
            "--hide-scrollbars",
            "--mute-audio",
        ] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
        assert!(args.iter().all(|a| !a.starts_with("--restore-last-session")));
    }

    #[test]
    fn test_launch_args_headful_and_extras() {
        let config = BrowserConfig {
            headless: false,
            window_width: 800,
            window_height: 600,
            extra_args: vec!["--proxy-server=http://127.0.0.1:8181".to_string(), " ".to_string()],
            ..BrowserConfig::default()
        };
        let args = launch_args(&config, 1, Path::new("/p"));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(args.contains(&"--window-size=800,600".to_string()));
        assert!(args.contains(&"--proxy-server=http://127.0.0.1:8181".to_string()));
        assert!(!args.iter().any(|a| a.trim().is_empty()));
    }

    #[test]
    fn test_configured_binary_comes_first() {
        let configured = PathBuf::from("/opt/chromium/chrome");
        let candidates = browser_binary_candidates(Some(&configured));
        assert_eq!(candidates[0], "/opt/chromium/chrome");
        assert!(candidates.contains(&"chromium".to_string()));
    }

    #[test]
    fn test_page_websocket_url_picks_page() {
        let targets = serde_json::json!([
            {
                "type": "service_worker",
                "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/SW"
            },
            {
                "type": "page",
                "url": "about:blank",
                "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/ABC"
            }
        ]);
        assert_eq!(
            page_websocket_url(&targets).as_deref(),
            Some("ws://127.0.0.1:1/devtools/page/ABC")
        );
    }

    #[test]
    fn test_page_websocket_url_none_without_page() {
        assert!(page_websocket_url(&serde_json::json!([])).is_none());
        assert!(page_websocket_url(&serde_json::json!({})).is_none());
    }

    #[test]
    fn test_pick_ephemeral_port() {
        assert!(pick_ephemeral_port().unwrap() > 0);
    }

    // -- Endpoint discovery -------------------------------------------------

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn local_listener() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("http://127.0.0.1:{port}/json/list"))
    }

    #[tokio::test]
    async fn test_discovery_gives_up_on_silent_endpoint() {
        let (listener, url) = local_listener().await;
        // Accept connections and hold them open without ever replying.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            discover_page_target(&url, Duration::from_millis(300), || None),
        )
        .await
        .expect("discovery must respect its own deadline");

        assert!(matches!(result, Err(FetchError::LaunchFailed { .. })), "got {result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_discovery_returns_page_target() {
        let (listener, url) = local_listener().await;
        tokio::spawn(async move {
            let body = r#"[{"type":"page","webSocketDebuggerUrl":"ws://127.0.0.1:1/devtools/page/P1"}]"#;
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let ws = discover_page_target(&url, Duration::from_secs(2), || None)
            .await
            .unwrap();
        assert_eq!(ws, "ws://127.0.0.1:1/devtools/page/P1");
    }

    #[tokio::test]
    async fn test_discovery_stops_when_browser_exits() {
        let (_listener, url) = local_listener().await;
        let err = discover_page_target(&url, Duration::from_secs(5), || {
            Some("exit status: 1".to_string())
        })
        .await
        .unwrap_err();
        match err {
            FetchError::LaunchFailed { reason } => assert!(reason.contains("exited")),
            other => panic!("expected LaunchFailed, got {other:?}"),
        }
    }
}
