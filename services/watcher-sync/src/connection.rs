//! Connection management for the push channel
//!
//! This module handles connection establishment and the hub handshake, the
//! reader task that dispatches inbound records, and the reconnection task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::{Result, SyncError};
use crate::io::{ChannelConnection, ConnectionFactory, FrameReader, FrameWriter};
use crate::protocol::{self, HubMessage};
use crate::types::ConnectionState;

/// Supplies the bearer token for each (re)connect attempt
pub type TokenSupplier = Arc<dyn Fn() -> Option<String> + Send + Sync>;

pub(crate) type MessageHandler = Arc<dyn Fn(&[serde_json::Value]) + Send + Sync>;
pub(crate) type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Invocation waiting for its completion record
pub(crate) struct PendingInvocation {
    pub target: String,
    pub sender: oneshot::Sender<Result<serde_json::Value>>,
}

/// Where to connect and how to authenticate, kept for reconnects
#[derive(Clone)]
pub(crate) struct Session {
    pub url: String,
    pub token_supplier: TokenSupplier,
}

/// Shared state for connection management
///
/// Holds everything the channel, the reader task and the reconnection task
/// need to see.
#[derive(Clone)]
pub(crate) struct SharedConnectionState {
    pub state: Arc<RwLock<ConnectionState>>,
    pub writer: Arc<Mutex<Option<Box<dyn FrameWriter>>>>,
    pub pending: Arc<Mutex<HashMap<String, PendingInvocation>>>,
    pub handlers: Arc<RwLock<HashMap<String, Vec<MessageHandler>>>>,
    pub state_handlers: Arc<RwLock<Vec<StateHandler>>>,
    pub reader_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    pub reconnect_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    pub session: Arc<Mutex<Option<Session>>>,
    pub cancel: Arc<Mutex<CancellationToken>>,
    pub auto_reconnect_enabled: Arc<AtomicBool>,
    pub connection_factory: Arc<dyn ConnectionFactory>,
}

impl SharedConnectionState {
    pub fn with_factory(
        auto_reconnect_enabled: bool,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            state_handlers: Arc::new(RwLock::new(Vec::new())),
            reader_handle: Arc::new(Mutex::new(None)),
            reconnect_handle: Arc::new(Mutex::new(None)),
            session: Arc::new(Mutex::new(None)),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            auto_reconnect_enabled: Arc::new(AtomicBool::new(auto_reconnect_enabled)),
            connection_factory,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Move to `new_state`, notifying state handlers if it changed
    pub async fn set_state(&self, new_state: ConnectionState) {
        let previous = {
            let mut guard = self.state.write().await;
            std::mem::replace(&mut *guard, new_state)
        };
        if previous == new_state {
            return;
        }

        debug!("Push channel state: {} -> {}", previous, new_state);
        let handlers = self.state_handlers.read().await.clone();
        for handler in handlers {
            handler(new_state);
        }
    }

    /// Run every handler registered for `target`, in registration order
    pub async fn dispatch(&self, target: &str, arguments: &[serde_json::Value]) {
        let handlers = self.handlers.read().await.get(target).cloned();
        match handlers {
            Some(handlers) => {
                for handler in handlers {
                    handler(arguments);
                }
            }
            None => debug!("No handler registered for '{}'", target),
        }
    }

    /// Resolve a pending invocation from its completion record
    pub async fn complete(
        &self,
        invocation_id: &str,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let pending = self.pending.lock().await.remove(invocation_id);
        match pending {
            Some(invocation) => {
                let outcome = match error {
                    Some(message) => Err(SyncError::InvocationFailed {
                        target: invocation.target,
                        message,
                    }),
                    None => Ok(result.unwrap_or(serde_json::Value::Null)),
                };
                let _ = invocation.sender.send(outcome);
            }
            None => debug!("Completion for unknown invocation {}", invocation_id),
        }
    }

    /// Fail every outstanding invocation
    pub async fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, invocation) in pending.drain() {
            let _ = invocation
                .sender
                .send(Err(SyncError::ConnectionFailed(reason.to_string())));
        }
    }

    /// Take and shut down the current writer, if any
    pub async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down push channel writer: {}", e);
            }
        }
    }

    /// Make an established connection current, unless `cancel` fired first
    ///
    /// The writer lock is held until the reader is registered, so a
    /// concurrent close either is seen here or tears the connection down
    /// after it is installed. Returns false when the connection was dropped.
    pub async fn install(
        &self,
        connection: ChannelConnection,
        leftover: Vec<String>,
        config: &ChannelConfig,
        cancel: &CancellationToken,
    ) -> bool {
        let mut writer = self.writer.lock().await;
        if cancel.is_cancelled() {
            drop(writer);
            let mut stale = connection.writer;
            if let Err(e) = stale.shutdown().await {
                debug!("Error shutting down cancelled connection: {}", e);
            }
            return false;
        }

        *writer = Some(connection.writer);
        self.set_state(ConnectionState::Connected).await;
        let reader_handle = spawn_reader_task(
            connection.reader,
            leftover,
            config.clone(),
            self.clone(),
            cancel.clone(),
        );
        *self.reader_handle.lock().await = Some(reader_handle);
        true
    }

    pub fn is_auto_reconnect_enabled(&self) -> bool {
        self.auto_reconnect_enabled.load(Ordering::SeqCst)
    }

    pub fn set_auto_reconnect_enabled(&self, enabled: bool) {
        debug!("Setting auto-reconnect enabled: {}", enabled);
        self.auto_reconnect_enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Connect and complete the hub handshake
///
/// Returns the connection together with any records the server sent in the
/// same frame as its handshake answer.
pub(crate) async fn establish(
    config: &ChannelConfig,
    session: &Session,
    factory: &Arc<dyn ConnectionFactory>,
) -> Result<(ChannelConnection, Vec<String>)> {
    let timeout = Duration::from_secs(config.connection_timeout_seconds);
    let token = (session.token_supplier)();
    let mut connection = factory.connect(&session.url, token, timeout).await?;

    match handshake(&mut connection, timeout).await {
        Ok(leftover) => Ok((connection, leftover)),
        Err(e) => {
            let _ = connection.writer.shutdown().await;
            Err(e)
        }
    }
}

async fn handshake(connection: &mut ChannelConnection, timeout: Duration) -> Result<Vec<String>> {
    connection
        .writer
        .write_frame(&protocol::handshake_frame()?)
        .await?;

    let frame = tokio::time::timeout(timeout, connection.reader.read_frame())
        .await
        .map_err(|_| SyncError::Timeout("Handshake response timed out".to_string()))??
        .ok_or_else(|| SyncError::ConnectionFailed("Connection closed during handshake".to_string()))?;

    let mut records = protocol::split_records(&frame);
    let answer = records
        .next()
        .ok_or_else(|| SyncError::Protocol("Empty handshake response".to_string()))?;
    protocol::parse_handshake(answer)?;
    debug!("Hub handshake completed");

    Ok(records.map(str::to_string).collect())
}

/// Spawn a reconnection task that re-establishes the channel
pub(crate) fn spawn_reconnect_task(
    config: ChannelConfig,
    shared: SharedConnectionState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.reconnect.interval_seconds);
        let max_retries = config.reconnect.max_retries;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if !shared.is_auto_reconnect_enabled() {
                debug!("Auto-reconnect disabled, stopping reconnection attempts");
                break;
            }

            if let Some(max) = max_retries {
                if attempt > max {
                    warn!("Reconnection failed: max retries ({}) exceeded", max);
                    break;
                }
            }

            info!(
                "Attempting to reconnect push channel (attempt {}/{})",
                attempt,
                max_retries.map_or("unlimited".to_string(), |m| m.to_string())
            );

            // Wait before attempting connection (unless first attempt)
            if attempt > 1 {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        debug!("Reconnection cancelled");
                        return;
                    }
                }
            }

            let session = shared.session.lock().await.clone();
            let Some(session) = session else {
                debug!("No session to reconnect");
                break;
            };

            let result = tokio::select! {
                result = establish(&config, &session, &shared.connection_factory) => result,
                _ = cancel.cancelled() => {
                    debug!("Reconnection cancelled during handshake");
                    return;
                }
            };

            match result {
                Ok((connection, leftover)) => {
                    if shared.install(connection, leftover, &config, &cancel).await {
                        info!("Push channel reconnected");
                    } else {
                        debug!("Reconnection cancelled after the handshake");
                    }
                    return;
                }
                Err(e) => {
                    debug!("Reconnection attempt {} failed: {}", attempt, e);
                }
            }
        }

        if !cancel.is_cancelled() {
            shared.set_state(ConnectionState::Disconnected).await;
        }
    })
}

/// Spawn a reader task that dispatches inbound records and keeps the
/// connection alive
pub(crate) fn spawn_reader_task(
    mut reader: Box<dyn FrameReader>,
    leftover: Vec<String>,
    config: ChannelConfig,
    shared: SharedConnectionState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let keep_alive = Duration::from_secs(config.keep_alive_seconds.max(1));
        let server_timeout = Duration::from_secs(config.server_timeout_seconds.max(1));
        let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        let mut last_frame = Instant::now();

        let mut early_close = None;
        for record in &leftover {
            if let Some(reason) = process_frame(record, &shared, &cancel).await {
                early_close = Some(reason);
                break;
            }
        }

        let disconnect_reason = match early_close {
            Some(reason) => reason,
            None => loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Reader task cancelled");
                        return;
                    }
                    _ = tokio::time::sleep_until(last_frame + server_timeout) => {
                        break format!("No frame received for {:?}", server_timeout);
                    }
                    _ = ping.tick() => {
                        let mut writer = shared.writer.lock().await;
                        if let Some(writer) = writer.as_mut() {
                            if let Err(e) = writer.write_frame(&protocol::ping_frame()).await {
                                debug!("Failed to send keep-alive: {}", e);
                            }
                        }
                    }
                    read = reader.read_frame() => match read {
                        Ok(None) => break "Connection closed by remote".to_string(),
                        Ok(Some(frame)) => {
                            last_frame = Instant::now();
                            debug!("Received from hub: {}", frame.trim_end_matches(protocol::RECORD_SEPARATOR));
                            if let Some(reason) = process_frame(&frame, &shared, &cancel).await {
                                break reason;
                            }
                        }
                        Err(e) => break format!("Read error: {}", e),
                    },
                }
            },
        };

        if cancel.is_cancelled() {
            return;
        }

        warn!("Push channel connection lost: {}", disconnect_reason);
        shared.fail_pending(&disconnect_reason).await;
        shared.close_writer().await;

        if shared.is_auto_reconnect_enabled() {
            debug!("Auto-reconnect enabled, starting reconnection task");
            shared.set_state(ConnectionState::Reconnecting).await;
            let reconnect = spawn_reconnect_task(config, shared.clone(), cancel);
            *shared.reconnect_handle.lock().await = Some(reconnect);
        } else {
            shared.set_state(ConnectionState::Disconnected).await;
        }
    })
}

/// Handle every record in a frame. Returns the close reason if the server
/// asked to close the connection.
async fn process_frame(
    frame: &str,
    shared: &SharedConnectionState,
    cancel: &CancellationToken,
) -> Option<String> {
    for record in protocol::split_records(frame) {
        if cancel.is_cancelled() {
            return None;
        }
        match HubMessage::parse(record) {
            Ok(HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            }) => {
                if invocation_id.is_some() {
                    debug!("Server invocation of '{}' expects a result; ignoring id", target);
                }
                shared.dispatch(&target, &arguments).await;
            }
            Ok(HubMessage::Completion {
                invocation_id,
                result,
                error,
            }) => shared.complete(&invocation_id, result, error).await,
            Ok(HubMessage::Ping) => {}
            Ok(HubMessage::Close { error }) => {
                return Some(error.unwrap_or_else(|| "Server closed the connection".to_string()));
            }
            Ok(HubMessage::Other(kind)) => debug!("Ignoring hub message type {}", kind),
            Err(e) => debug!("Failed to parse hub message {}: {}", record, e),
        }
    }
    None
}
