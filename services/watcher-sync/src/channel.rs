//! Push channel client
//!
//! Owns one hub connection: opens it, registers server-push handlers,
//! sends invocations and reconnects with a bounded policy after a drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ChannelConfig;
use crate::connection::{
    establish, PendingInvocation, Session, SharedConnectionState, TokenSupplier,
};
use crate::error::{Result, SyncError};
use crate::io::{ConnectionFactory, WebSocketConnectionFactory};
use crate::protocol::InvocationRequest;
use crate::types::ConnectionState;

/// An invocation that has been written to the wire
pub struct PendingCompletion {
    target: String,
    timeout: Duration,
    receiver: oneshot::Receiver<Result<serde_json::Value>>,
}

impl PendingCompletion {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait for the server's completion record
    pub async fn completion(self) -> Result<serde_json::Value> {
        tokio::time::timeout(self.timeout, self.receiver)
            .await
            .map_err(|_| SyncError::Timeout(format!("Invocation '{}' timed out", self.target)))?
            .map_err(|_| SyncError::ReceiveError)?
    }
}

/// Client side of the watcher hub
pub struct PushChannel {
    config: ChannelConfig,
    shared: SharedConnectionState,
    invocation_id: AtomicU64,
}

impl PushChannel {
    /// Create a channel that connects over WebSocket
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_connection_factory(config, Arc::new(WebSocketConnectionFactory::new()))
    }

    /// Create a channel with a custom connection factory
    pub fn with_connection_factory(
        config: ChannelConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let shared =
            SharedConnectionState::with_factory(config.reconnect.enabled, connection_factory);
        Self {
            config,
            shared,
            invocation_id: AtomicU64::new(1),
        }
    }

    /// Connect to `url` and complete the handshake
    ///
    /// `token_supplier` is consulted on every attempt, including reconnects.
    /// A failed initial open leaves the channel `Disconnected`; only drops of
    /// an established connection are retried.
    pub async fn open(&self, url: impl Into<String>, token_supplier: TokenSupplier) -> Result<()> {
        let current = self.shared.state().await;
        if current != ConnectionState::Disconnected {
            return Err(SyncError::InvalidState(format!(
                "Cannot open push channel while {}",
                current
            )));
        }

        let session = Session {
            url: url.into(),
            token_supplier,
        };
        let cancel = CancellationToken::new();
        *self.shared.cancel.lock().await = cancel.clone();
        *self.shared.session.lock().await = Some(session.clone());

        info!("Opening push channel to {}", session.url);
        self.shared.set_state(ConnectionState::Connecting).await;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Open cancelled before the handshake completed");
                return Err(SyncError::Closed);
            }
            result = establish(&self.config, &session, &self.shared.connection_factory) => result,
        };

        let (connection, leftover) = match result {
            Ok(established) => established,
            Err(e) => {
                if !cancel.is_cancelled() {
                    self.shared.set_state(ConnectionState::Disconnected).await;
                }
                return Err(e);
            }
        };

        if !self
            .shared
            .install(connection, leftover, &self.config, &cancel)
            .await
        {
            debug!("Open cancelled after the handshake completed");
            return Err(SyncError::Closed);
        }

        info!("Push channel connected");
        Ok(())
    }

    /// Stop the channel: no further handlers run and no reconnect happens
    pub async fn close(&self) {
        debug!("Closing push channel");
        self.shared.cancel.lock().await.cancel();

        if let Some(handle) = self.shared.reconnect_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.shared.reader_handle.lock().await.take() {
            handle.abort();
        }

        self.shared.close_writer().await;
        self.shared.fail_pending("Push channel closed").await;
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Register a handler for a server-push event
    ///
    /// Several handlers may share an event; they run in registration order.
    pub async fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&[serde_json::Value]) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .await
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for connection state transitions
    pub async fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.shared.state_handlers.write().await.push(Arc::new(handler));
    }

    /// Write an invocation to the wire without waiting for its result
    pub async fn send_invocation(
        &self,
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<PendingCompletion> {
        if !self.is_connected().await {
            return Err(SyncError::NotConnected);
        }

        let id = self
            .invocation_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let frame = InvocationRequest::new(id.clone(), target, arguments).to_frame()?;

        debug!("Sending invocation {} ({})", target, id);

        let (sender, receiver) = oneshot::channel();
        self.shared.pending.lock().await.insert(
            id.clone(),
            PendingInvocation {
                target: target.to_string(),
                sender,
            },
        );

        let written = {
            let mut writer_guard = self.shared.writer.lock().await;
            match writer_guard.as_mut() {
                Some(writer) => writer.write_frame(&frame).await,
                None => Err(SyncError::NotConnected),
            }
        };
        if let Err(e) = written {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        Ok(PendingCompletion {
            target: target.to_string(),
            timeout: Duration::from_secs(self.config.command_timeout_seconds),
            receiver,
        })
    }

    /// Invoke a hub method and wait for its completion
    pub async fn invoke(
        &self,
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.send_invocation(target, arguments)
            .await?
            .completion()
            .await
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.state().await == ConnectionState::Connected
    }

    pub fn is_auto_reconnect_enabled(&self) -> bool {
        self.shared.is_auto_reconnect_enabled()
    }

    pub fn set_auto_reconnect_enabled(&self, enabled: bool) {
        self.shared.set_auto_reconnect_enabled(enabled);
    }
}
