//! In-memory stand-ins for the watcher hub and the REST server

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use watcher_sync::config::{ChannelConfig, ReconnectConfig};
use watcher_sync::io::{
    ChannelConnection, ConnectionFactory, FrameReader, FrameWriter, HttpClient, HttpRequest,
    HttpResponse,
};
use watcher_sync::{Notification, SessionHandler, SyncError};

pub const HUB_URL: &str = "ws://hub.test/hubs/watchers";
const RS: char = '\u{1e}';

/// Channel settings with instant reconnects
pub fn fast_channel_config(max_retries: Option<u32>) -> ChannelConfig {
    ChannelConfig {
        connection_timeout_seconds: 2,
        command_timeout_seconds: 2,
        reconnect: ReconnectConfig {
            enabled: true,
            interval_seconds: 0,
            max_retries,
        },
        ..Default::default()
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Hub
// ============================================================================

enum HubEvent {
    Frame(String),
    Close,
}

#[derive(Default)]
struct HubState {
    live: StdMutex<Option<mpsc::UnboundedSender<HubEvent>>>,
    invocations: StdMutex<Vec<(String, Vec<Value>)>>,
    tokens: StdMutex<Vec<Option<String>>>,
    failing_targets: StdMutex<HashMap<String, String>>,
    connect_count: AtomicU32,
    refuse: AtomicBool,
    hold_handshake: AtomicBool,
    writer_shutdowns: AtomicU32,
}

/// Scriptable hub that answers the handshake and completes invocations
#[derive(Clone, Default)]
pub struct MockHub {
    state: Arc<HubState>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    pub fn connect_count(&self) -> u32 {
        self.state.connect_count.load(Ordering::SeqCst)
    }

    pub fn writer_shutdowns(&self) -> u32 {
        self.state.writer_shutdowns.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.state.tokens.lock().unwrap().clone()
    }

    /// Refuse every new connection
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Accept connections but never answer the handshake
    pub fn set_hold_handshake(&self, hold: bool) {
        self.state.hold_handshake.store(hold, Ordering::SeqCst);
    }

    /// Complete invocations of `target` with an error
    pub fn fail_target(&self, target: &str, error: &str) {
        self.state
            .failing_targets
            .lock()
            .unwrap()
            .insert(target.to_string(), error.to_string());
    }

    pub fn invocations(&self, target: &str) -> Vec<Vec<Value>> {
        self.state
            .invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn invocation_count(&self, target: &str) -> usize {
        self.invocations(target).len()
    }

    /// Send a server push on the live connection
    pub fn push(&self, target: &str, arguments: Vec<Value>) -> bool {
        let record = json!({"type": 1, "target": target, "arguments": arguments});
        self.send_raw(format!("{}{}", record, RS))
    }

    pub fn send_raw(&self, frame: String) -> bool {
        match self.state.live.lock().unwrap().as_ref() {
            Some(sender) => sender.send(HubEvent::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Answer a handshake that was held back
    pub fn answer_handshake(&self) -> bool {
        self.send_raw(format!("{{}}{}", RS))
    }

    /// Drop the live connection as a network failure would
    pub fn drop_connection(&self) {
        if let Some(sender) = self.state.live.lock().unwrap().take() {
            let _ = sender.send(HubEvent::Close);
        }
    }
}

#[async_trait]
impl ConnectionFactory for MockHub {
    async fn connect(
        &self,
        _url: &str,
        token: Option<String>,
        _timeout: Duration,
    ) -> watcher_sync::Result<ChannelConnection> {
        self.state.connect_count.fetch_add(1, Ordering::SeqCst);
        self.state.tokens.lock().unwrap().push(token);

        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionFailed("Mock hub refused".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        *self.state.live.lock().unwrap() = Some(sender.clone());

        Ok(ChannelConnection {
            reader: Box::new(HubReader { receiver }),
            writer: Box::new(HubWriter {
                sender,
                state: self.state.clone(),
                handshaken: false,
            }),
        })
    }
}

struct HubReader {
    receiver: mpsc::UnboundedReceiver<HubEvent>,
}

#[async_trait]
impl FrameReader for HubReader {
    async fn read_frame(&mut self) -> watcher_sync::Result<Option<String>> {
        match self.receiver.recv().await {
            Some(HubEvent::Frame(frame)) => Ok(Some(frame)),
            Some(HubEvent::Close) | None => Ok(None),
        }
    }
}

struct HubWriter {
    sender: mpsc::UnboundedSender<HubEvent>,
    state: Arc<HubState>,
    handshaken: bool,
}

#[async_trait]
impl FrameWriter for HubWriter {
    async fn write_frame(&mut self, frame: &str) -> watcher_sync::Result<()> {
        for record in frame.split(RS).filter(|r| !r.trim().is_empty()) {
            if !self.handshaken {
                self.handshaken = true;
                if !self.state.hold_handshake.load(Ordering::SeqCst) {
                    let _ = self.sender.send(HubEvent::Frame(format!("{{}}{}", RS)));
                }
                continue;
            }

            let message: Value = serde_json::from_str(record)?;
            if message["type"] != json!(1) {
                continue;
            }
            let target = message["target"].as_str().unwrap_or_default().to_string();
            let arguments = message["arguments"].as_array().cloned().unwrap_or_default();
            self.state
                .invocations
                .lock()
                .unwrap()
                .push((target.clone(), arguments));

            if let Some(id) = message["invocationId"].as_str() {
                let error = self.state.failing_targets.lock().unwrap().get(&target).cloned();
                let completion = match error {
                    Some(error) => json!({"type": 3, "invocationId": id, "error": error}),
                    None => json!({"type": 3, "invocationId": id, "result": null}),
                };
                let _ = self
                    .sender
                    .send(HubEvent::Frame(format!("{}{}", completion, RS)));
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> watcher_sync::Result<()> {
        self.state.writer_shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// REST server
// ============================================================================

type Responder = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// HTTP client answering from a closure, with optional per-prefix gates
pub struct ScriptedHttpClient {
    responder: Responder,
    gates: StdMutex<HashMap<String, Arc<Notify>>>,
    requests: StdMutex<Vec<HttpRequest>>,
    completed: AtomicU32,
}

impl ScriptedHttpClient {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            gates: StdMutex::new(HashMap::new()),
            requests: StdMutex::new(Vec::new()),
            completed: AtomicU32::new(0),
        })
    }

    /// Hold queries whose search prefix is `prefix` until released
    pub fn gate(&self, prefix: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(prefix.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, prefix: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(prefix) {
            gate.notify_one();
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn execute(&self, request: HttpRequest) -> watcher_sync::Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let gate = query_param(&request.url, "prefix")
            .and_then(|prefix| self.gates.lock().unwrap().get(&prefix).cloned());
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let response = (self.responder)(&request);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    }
}

/// Value of `name` in the query string of `url`
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then(|| value.to_string())
    })
}

pub fn ok(body: Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: body.to_string(),
    }
}

pub fn status(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        body: String::new(),
    }
}

pub fn watcher(index: usize) -> Value {
    json!({
        "id": format!("w{}", index),
        "username": format!("viewer{}", index),
        "platform": "youtube",
        "interaction": "comment"
    })
}

pub fn page_body(rows: usize, total_items: u64, page_size: u64) -> Value {
    json!({
        "data": (1..=rows).map(watcher).collect::<Vec<_>>(),
        "page": 1,
        "pageSize": page_size,
        "totalItems": total_items,
        "totalPages": total_items.div_ceil(page_size).max(1),
    })
}

// ============================================================================
// Front-end collaborators
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: StdMutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

impl watcher_sync::Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
    }
}

#[derive(Default)]
pub struct RecordingSession {
    redirects: StdMutex<Vec<String>>,
}

impl RecordingSession {
    pub fn redirects(&self) -> Vec<String> {
        self.redirects.lock().unwrap().clone()
    }
}

impl SessionHandler for RecordingSession {
    fn session_expired(&self, route: &str) {
        self.redirects.lock().unwrap().push(route.to_string());
    }
}
