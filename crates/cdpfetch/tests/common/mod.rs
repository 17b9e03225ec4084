//! Shared helpers for integration tests.
//!
//! Provides a scripted, in-memory browser implementing the session traits.
//! `Page.navigate` replays a page's network traffic as CDP events, waits
//! until every paused request has been answered (as Chrome does), emits the
//! document's `Network.responseReceived`, and then returns. The page's
//! `Page.loadEventFired` follows later, after `Script::load_delay`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use cdpfetch::{
    BrowserFetcher, BrowserSession, CdpEvent, CommandChannel, EventReceiver, FetchConfig,
    FetchError, ProfileRoot, SessionLauncher,
};

/// Command-log entry written when the page's load event fires.
pub const LOAD_MARKER: &str = "event:Page.loadEventFired";

/// One request the scripted page makes during navigation.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub network_id: String,
    pub interception_id: String,
    pub url: String,
    pub resource_type: String,
    pub referer: Option<String>,
}

impl PageRequest {
    pub fn document(url: &str) -> Self {
        Self {
            network_id: "1000.1".to_string(),
            interception_id: "interception-job-1.0".to_string(),
            url: url.to_string(),
            resource_type: "Document".to_string(),
            referer: None,
        }
    }

    pub fn subresource(n: u32, url: &str, resource_type: &str, referer: &str) -> Self {
        Self {
            network_id: format!("1000.{}", n + 1),
            interception_id: format!("interception-job-{}.0", n + 1),
            url: url.to_string(),
            resource_type: resource_type.to_string(),
            referer: Some(referer.to_string()),
        }
    }
}

/// How the scripted browser behaves for one session.
#[derive(Debug, Clone)]
pub struct Script {
    pub traffic: Vec<PageRequest>,
    /// Status reported for the first request in `traffic`; `None` sends no
    /// `Network.responseReceived` at all.
    pub status: Option<u16>,
    pub response_headers: HashMap<String, String>,
    pub html: String,
    /// Command method that answers with a CDP error.
    pub fail_method: Option<String>,
    /// `errorText` returned from `Page.navigate`.
    pub navigation_error: Option<String>,
    /// How long `Page.navigate` stalls before doing anything.
    pub navigate_delay: Duration,
    /// Interception commands answer with a CDP error.
    pub fail_interception: bool,
    /// Time between the `Page.navigate` reply and `Page.loadEventFired`.
    pub load_delay: Duration,
}

impl Script {
    pub fn page(url: &str, status: u16, html: &str) -> Self {
        Self {
            traffic: vec![PageRequest::document(url)],
            status: Some(status),
            response_headers: HashMap::from([(
                "content-type".to_string(),
                "text/html; charset=utf-8".to_string(),
            )]),
            html: html.to_string(),
            fail_method: None,
            navigation_error: None,
            navigate_delay: Duration::ZERO,
            fail_interception: false,
            load_delay: Duration::ZERO,
        }
    }
}

/// What happened to an intercepted request.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Failed { reason: String },
    Continued { params: Value },
}

/// Everything observable about the scripted sessions.
#[derive(Debug, Default)]
pub struct Record {
    pub commands: Mutex<Vec<(String, Value)>>,
    pub answers: Mutex<Vec<(String, Answer)>>,
    pub launches: AtomicUsize,
    pub stops: AtomicUsize,
    pub profiles: Mutex<Vec<PathBuf>>,
}

impl Record {
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn answers(&self) -> Vec<(String, Answer)> {
        self.answers.lock().unwrap().clone()
    }

    /// Answers given to one interception id.
    pub fn answers_for(&self, interception_id: &str) -> Vec<Answer> {
        self.answers()
            .into_iter()
            .filter(|(id, _)| id == interception_id)
            .map(|(_, a)| a)
            .collect()
    }
}

pub struct ScriptedLauncher {
    script: Script,
    pub record: Arc<Record>,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            record: Arc::new(Record::default()),
        })
    }
}

#[async_trait]
impl SessionLauncher for ScriptedLauncher {
    async fn launch(&self, profiles: &ProfileRoot) -> Result<Box<dyn BrowserSession>, FetchError> {
        self.record.launches.fetch_add(1, Ordering::SeqCst);
        let profile = profiles.session_profile()?;
        self.record
            .profiles
            .lock()
            .unwrap()
            .push(profile.path().to_path_buf());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let commands = Arc::new(ScriptedCommands {
            script: self.script.clone(),
            record: Arc::clone(&self.record),
            events: event_tx,
            answered: Notify::new(),
        });
        Ok(Box::new(ScriptedSession {
            commands,
            events: Some(event_rx),
            record: Arc::clone(&self.record),
            _profile: profile,
        }))
    }
}

pub struct ScriptedSession {
    commands: Arc<ScriptedCommands>,
    events: Option<EventReceiver>,
    record: Arc<Record>,
    _profile: cdpfetch::profile::SessionProfile,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    fn commands(&self) -> Arc<dyn CommandChannel> {
        self.commands.clone()
    }

    fn take_events(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }

    async fn stop(&mut self) {
        self.record.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedCommands {
    script: Script,
    record: Arc<Record>,
    events: mpsc::UnboundedSender<CdpEvent>,
    answered: Notify,
}

impl ScriptedCommands {
    fn emit(&self, method: &str, params: Value) {
        let _ = self.events.send(CdpEvent {
            method: method.to_string(),
            params,
        });
    }

    fn answer(&self, id: &str, answer: Answer) -> Result<Value, FetchError> {
        self.record
            .answers
            .lock()
            .unwrap()
            .push((id.to_string(), answer));
        self.answered.notify_waiters();
        if self.script.fail_interception {
            return Err(FetchError::CdpError {
                code: -32602,
                message: "Invalid InterceptionId.".to_string(),
                data: None,
            });
        }
        Ok(serde_json::json!({}))
    }

    /// Fire `Page.loadEventFired` once `load_delay` has passed. Recorded in
    /// the command log as `event:Page.loadEventFired`.
    fn schedule_load(&self) {
        let events = self.events.clone();
        let record = Arc::clone(&self.record);
        let delay = self.script.load_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            record
                .commands
                .lock()
                .unwrap()
                .push((LOAD_MARKER.to_string(), Value::Null));
            let _ = events.send(CdpEvent {
                method: "Page.loadEventFired".to_string(),
                params: serde_json::json!({ "timestamp": 1.0 }),
            });
        });
    }

    async fn wait_for_answers(&self, expected: usize) {
        loop {
            let notified = self.answered.notified();
            if self.record.answers.lock().unwrap().len() >= expected {
                return;
            }
            notified.await;
        }
    }

    async fn navigate(&self) -> Result<Value, FetchError> {
        if !self.script.navigate_delay.is_zero() {
            tokio::time::sleep(self.script.navigate_delay).await;
        }

        for req in &self.script.traffic {
            let mut headers = serde_json::json!({ "User-Agent": "HeadlessChrome" });
            if let Some(referer) = &req.referer {
                headers["Referer"] = Value::String(referer.clone());
            }
            self.emit(
                "Network.requestWillBeSent",
                serde_json::json!({
                    "requestId": req.network_id,
                    "request": { "url": req.url, "method": "GET", "headers": headers },
                    "type": req.resource_type,
                }),
            );
            self.emit(
                "Fetch.requestPaused",
                serde_json::json!({
                    "requestId": req.interception_id,
                    "request": { "url": req.url, "method": "GET", "headers": headers },
                    "frameId": "F1",
                    "resourceType": req.resource_type,
                    "networkId": req.network_id,
                }),
            );
        }

        self.wait_for_answers(self.script.traffic.len()).await;

        if let (Some(status), Some(doc)) = (self.script.status, self.script.traffic.first()) {
            self.emit(
                "Network.responseReceived",
                serde_json::json!({
                    "requestId": doc.network_id,
                    "type": doc.resource_type,
                    "response": {
                        "url": doc.url,
                        "status": status,
                        "headers": self.script.response_headers,
                    },
                }),
            );
        }

        let mut result = serde_json::json!({ "frameId": "F1", "loaderId": "L1" });
        match &self.script.navigation_error {
            Some(error_text) => result["errorText"] = Value::String(error_text.clone()),
            None => self.schedule_load(),
        }
        Ok(result)
    }
}

#[async_trait]
impl CommandChannel for ScriptedCommands {
    async fn send_command(
        &self,
        method: &str,
        params: Value,
        _timeout: Duration,
    ) -> Result<Value, FetchError> {
        self.record
            .commands
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        if self.script.fail_method.as_deref() == Some(method) {
            return Err(FetchError::CdpError {
                code: -32601,
                message: format!("'{method}' wasn't found"),
                data: None,
            });
        }

        let id = params["requestId"].as_str().unwrap_or_default().to_string();
        match method {
            "Page.navigate" => self.navigate().await,
            "Fetch.failRequest" => self.answer(
                &id,
                Answer::Failed {
                    reason: params["errorReason"].as_str().unwrap_or_default().to_string(),
                },
            ),
            "Fetch.continueRequest" => self.answer(&id, Answer::Continued { params }),
            "DOM.getDocument" => Ok(serde_json::json!({ "root": { "nodeId": 1, "nodeName": "#document" } })),
            "DOM.querySelector" => Ok(serde_json::json!({ "nodeId": 2 })),
            "DOM.getOuterHTML" => Ok(serde_json::json!({ "outerHTML": self.script.html })),
            _ => Ok(serde_json::json!({})),
        }
    }
}

/// Config with short deadlines suited to in-memory sessions.
pub fn test_config() -> FetchConfig {
    FetchConfig {
        ready_poll_interval_ms: 1,
        ..FetchConfig::default()
    }
}

/// A fetcher over `launcher` with a fresh temporary profile root.
pub fn fetcher_for(launcher: Arc<ScriptedLauncher>) -> (BrowserFetcher, Arc<ProfileRoot>) {
    let profiles = Arc::new(ProfileRoot::temporary().expect("should create profile root"));
    let fetcher = BrowserFetcher::with_launcher(test_config(), Arc::clone(&profiles), launcher);
    (fetcher, profiles)
}
