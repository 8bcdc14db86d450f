//! Watcher sync driver
//!
//! Mounting a [`WatcherSync`] opens the push channel, issues the initial
//! query and spawns one task that owns the [`SyncCore`]. Channel events,
//! query resolutions and parameter changes all reach that task through a
//! single ordered queue; every change to the read model is published on a
//! `watch` channel.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiResult};
use crate::channel::PushChannel;
use crate::connection::TokenSupplier;
use crate::state::{Effect, QueryOutcome, QueryTicket, SyncCore, WatcherSnapshot};
use crate::error::{ApiError, Result};
use crate::notifier::{Notification, Notifier};
use crate::protocol::{MAKE_LISTENER, SET_VIDEO_ID, STREAMLABS_TOKEN_UPDATED, UPDATE_WATCHERS};
use crate::types::{ConnectionState, ListenerTarget, PageResult, Watcher, WatcherQuery};

const WATCHER_DELETED: &str = "Watcher deleted successfully";
const ALL_WATCHERS_DELETED: &str = "All watchers deleted successfully";
const DELETE_WATCHER_FALLBACK: &str = "Failed to delete watcher";
const DELETE_ALL_FALLBACK: &str = "Failed to delete all watchers";

/// Which delete a result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    One,
    All,
}

/// User feedback for a finished delete
///
/// A rejected session already went through recovery and gets no toast.
pub fn delete_notification(scope: DeleteScope, result: &ApiResult<()>) -> Option<Notification> {
    let (success, fallback) = match scope {
        DeleteScope::One => (WATCHER_DELETED, DELETE_WATCHER_FALLBACK),
        DeleteScope::All => (ALL_WATCHERS_DELETED, DELETE_ALL_FALLBACK),
    };
    match result {
        Ok(()) => Some(Notification::success(success)),
        Err(e) if e.is_unauthorized() => None,
        Err(e) if e.message.is_empty() => Some(Notification::error(fallback)),
        Err(e) => Some(Notification::error(e.message.as_str())),
    }
}

/// Inputs consumed by the sync loop, in arrival order
#[derive(Debug)]
enum SyncInput {
    Connection(ConnectionState),
    Watchers(Vec<Watcher>),
    ListenerTarget(ListenerTarget),
    SetQuery(WatcherQuery),
    Refresh,
    QueryResolved(QueryTicket, ApiResult<PageResult>),
}

/// A mounted watcher dashboard session
pub struct WatcherSync {
    inputs: mpsc::UnboundedSender<SyncInput>,
    snapshots: watch::Receiver<WatcherSnapshot>,
    channel: Arc<PushChannel>,
    api: Arc<ApiClient>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherSync {
    /// Register the push handlers, start the initial query and open the
    /// channel to `hub_url`
    pub async fn mount(
        channel: PushChannel,
        api: Arc<ApiClient>,
        notifier: Arc<dyn Notifier>,
        hub_url: impl Into<String>,
        query: WatcherQuery,
    ) -> Self {
        let channel = Arc::new(channel);
        let (inputs, receiver) = mpsc::unbounded_channel();
        let core = SyncCore::new(query);
        let (publisher, snapshots) = watch::channel(core.snapshot().clone());
        let cancel = CancellationToken::new();

        register_handlers(&channel, &inputs).await;

        // Initial query is queued ahead of any channel event
        let _ = inputs.send(SyncInput::Refresh);

        let credentials = api.credentials().clone();
        let token_supplier: TokenSupplier = Arc::new(move || credentials.get_token());
        let open_task = {
            let channel = channel.clone();
            let hub_url = hub_url.into();
            tokio::spawn(async move {
                if let Err(e) = channel.open(hub_url, token_supplier).await {
                    warn!("Push channel unavailable: {}", e);
                }
            })
        };

        let sync_loop = SyncLoop {
            core,
            inputs: inputs.clone(),
            publisher,
            channel: channel.clone(),
            api: api.clone(),
            notifier: notifier.clone(),
        };
        let task = tokio::spawn(sync_loop.run(receiver, open_task, cancel.clone()));

        info!("Watcher sync mounted");
        Self {
            inputs,
            snapshots,
            channel,
            api,
            notifier,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Latest published read model
    pub fn snapshot(&self) -> WatcherSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes every read-model change
    pub fn subscribe(&self) -> watch::Receiver<WatcherSnapshot> {
        self.snapshots.clone()
    }

    /// Change the query parameters and issue a new query
    pub fn set_query(&self, query: WatcherQuery) {
        self.submit(SyncInput::SetQuery(query));
    }

    /// Re-run the current query
    pub fn refresh(&self) {
        self.submit(SyncInput::Refresh);
    }

    /// Ask the server to listen to `video_id` with `streamlabs_token`
    ///
    /// The displayed target only changes once the server echoes it back.
    pub async fn request_set_listener(&self, video_id: &str, streamlabs_token: &str) -> Result<()> {
        let arguments = vec![
            Value::String(video_id.to_string()),
            Value::String(streamlabs_token.to_string()),
        ];
        match self.channel.invoke(SET_VIDEO_ID, arguments).await {
            Ok(_) => {
                debug!("Listener target requested for video {}", video_id);
                Ok(())
            }
            Err(e) => {
                warn!("{} failed: {}", SET_VIDEO_ID, e);
                self.notifier
                    .notify(Notification::error(format!("Failed to update listener: {}", e)));
                Err(e)
            }
        }
    }

    /// Reset the listener target to "not set"
    pub async fn request_clear_listener(&self) -> Result<()> {
        self.request_set_listener(ListenerTarget::UNSET, ListenerTarget::UNSET)
            .await
    }

    pub async fn request_delete_watcher(&self, id: &str) -> ApiResult<()> {
        let result = self.api.delete_watcher(id).await;
        self.after_delete(DeleteScope::One, result)
    }

    pub async fn request_delete_all_watchers(&self) -> ApiResult<()> {
        let result = self.api.delete_all_watchers().await;
        self.after_delete(DeleteScope::All, result)
    }

    fn after_delete(&self, scope: DeleteScope, result: ApiResult<()>) -> ApiResult<()> {
        if let Some(notification) = delete_notification(scope, &result) {
            self.notifier.notify(notification);
        }
        if result.is_ok() {
            self.refresh();
        }
        result
    }

    /// Close the push channel and stop the sync loop
    ///
    /// Safe to call at any point, including while the channel is still
    /// handshaking. The last published snapshot is the unmounted one.
    pub async fn unmount(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Sync loop ended abnormally: {}", e);
            }
        }
        info!("Watcher sync unmounted");
    }

    fn submit(&self, input: SyncInput) {
        if self.inputs.send(input).is_err() {
            debug!("Sync loop already stopped");
        }
    }
}

impl Drop for WatcherSync {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn register_handlers(channel: &PushChannel, inputs: &mpsc::UnboundedSender<SyncInput>) {
    let sender = inputs.clone();
    channel
        .on_state_change(move |state| {
            let _ = sender.send(SyncInput::Connection(state));
        })
        .await;

    let sender = inputs.clone();
    channel
        .on(UPDATE_WATCHERS, move |arguments| match parse_roster(arguments) {
            Ok(roster) => {
                let _ = sender.send(SyncInput::Watchers(roster));
            }
            Err(e) => warn!("Ignoring malformed {} push: {}", UPDATE_WATCHERS, e),
        })
        .await;

    let sender = inputs.clone();
    channel
        .on(STREAMLABS_TOKEN_UPDATED, move |arguments| {
            match parse_listener_target(arguments) {
                Ok(target) => {
                    let _ = sender.send(SyncInput::ListenerTarget(target));
                }
                Err(e) => warn!("Ignoring malformed {} push: {}", STREAMLABS_TOKEN_UPDATED, e),
            }
        })
        .await;
}

fn parse_roster(arguments: &[Value]) -> Result<Vec<Watcher>> {
    match arguments.first() {
        Some(roster) => Ok(serde_json::from_value(roster.clone())?),
        None => Err(crate::SyncError::Protocol(
            "Roster push without arguments".to_string(),
        )),
    }
}

/// Accepts either one `{videoId, streamlabsToken}` object or the two values
/// as separate arguments
fn parse_listener_target(arguments: &[Value]) -> Result<ListenerTarget> {
    match arguments {
        [Value::String(video_id), Value::String(token), ..] => {
            Ok(ListenerTarget::new(video_id.as_str(), token.as_str()))
        }
        [target, ..] => Ok(serde_json::from_value(target.clone())?),
        [] => Err(crate::SyncError::Protocol(
            "Listener target push without arguments".to_string(),
        )),
    }
}

struct SyncLoop {
    core: SyncCore,
    inputs: mpsc::UnboundedSender<SyncInput>,
    publisher: watch::Sender<WatcherSnapshot>,
    channel: Arc<PushChannel>,
    api: Arc<ApiClient>,
    notifier: Arc<dyn Notifier>,
}

impl SyncLoop {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<SyncInput>,
        open_task: JoinHandle<()>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                input = receiver.recv() => match input {
                    Some(input) => {
                        self.apply(input).await;
                        self.publish();
                    }
                    None => break,
                },
            }
        }

        open_task.abort();
        let _ = open_task.await;
        self.channel.close().await;
        self.core.on_unmount();
        self.publish();
        debug!("Sync loop stopped");
    }

    async fn apply(&mut self, input: SyncInput) {
        match input {
            SyncInput::Connection(state) => {
                for effect in self.core.on_connection_state(state) {
                    self.run_effect(effect).await;
                }
            }
            SyncInput::Watchers(roster) => self.core.on_update_watchers(roster),
            SyncInput::ListenerTarget(target) => {
                debug!("Listener target is now {}", target);
                self.core.on_listener_target(target);
            }
            SyncInput::SetQuery(query) => {
                let ticket = self.core.request_query(query);
                self.spawn_query(ticket);
            }
            SyncInput::Refresh => {
                let ticket = self.core.refresh_query();
                self.spawn_query(ticket);
            }
            SyncInput::QueryResolved(ticket, result) => {
                let seq = ticket.seq;
                match self.core.on_query_resolved(ticket, result) {
                    QueryOutcome::Applied => debug!("Applied query result #{}", seq),
                    QueryOutcome::Stale | QueryOutcome::Unauthorized => {}
                    QueryOutcome::Failed(e) => self.notify_query_failure(e),
                }
            }
        }
    }

    async fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::MakeListener => {
                // Written before the next input is processed; the result
                // is only awaited in the background
                match self.channel.send_invocation(MAKE_LISTENER, Vec::new()).await {
                    Ok(pending) => {
                        tokio::spawn(async move {
                            if let Err(e) = pending.completion().await {
                                warn!("{} failed: {}", MAKE_LISTENER, e);
                            }
                        });
                    }
                    Err(e) => warn!("{} failed: {}", MAKE_LISTENER, e),
                }
            }
        }
    }

    fn spawn_query(&self, ticket: QueryTicket) {
        debug!("Issuing query #{} {:?}", ticket.seq, ticket.query);
        let api = self.api.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = api.get_watchers(&ticket.query).await;
            let _ = inputs.send(SyncInput::QueryResolved(ticket, result));
        });
    }

    fn notify_query_failure(&self, error: ApiError) {
        warn!("Watcher query failed: {}", error);
        self.notifier.notify(Notification::error(error.message));
    }

    fn publish(&self) {
        let snapshot = self.core.snapshot();
        self.publisher.send_if_modified(|current| {
            if *current == *snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LogSessionHandler;
    use crate::config::ChannelConfig;
    use crate::credentials::MemoryCredentialStore;
    use crate::io::{HttpMethod, HttpResponse, MockConnectionFactory, MockHttpClient};
    use crate::notifier::{MockNotifier, NotificationLevel};
    use crate::SyncError;
    use serde_json::json;

    async fn mount_offline(http: MockHttpClient, notifier: MockNotifier) -> WatcherSync {
        let mut factory = MockConnectionFactory::new();
        factory.expect_connect().returning(|_, _, _| {
            Box::pin(async { Err(SyncError::ConnectionFailed("offline".to_string())) })
        });
        let api = ApiClient::new(
            "http://dash.test",
            Arc::new(http),
            Arc::new(MemoryCredentialStore::with_token("t")),
            Arc::new(LogSessionHandler),
        )
        .unwrap();
        WatcherSync::mount(
            PushChannel::with_connection_factory(ChannelConfig::default(), Arc::new(factory)),
            Arc::new(api),
            Arc::new(notifier),
            "ws://dash.test/hubs/watchers",
            WatcherQuery::default(),
        )
        .await
    }

    fn empty_page() -> HttpResponse {
        HttpResponse {
            status: 200,
            body: r#"{"data":[],"page":1,"pageSize":10,"totalItems":0,"totalPages":1}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn delete_success_notifies_once() {
        let mut http = MockHttpClient::new();
        http.expect_execute().returning(|request| {
            let response = match request.method {
                HttpMethod::Delete => HttpResponse {
                    status: 204,
                    body: String::new(),
                },
                _ => empty_page(),
            };
            Box::pin(async move { Ok(response) })
        });
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|n| n.level == NotificationLevel::Success && n.message == WATCHER_DELETED)
            .times(1)
            .return_const(());

        let sync = mount_offline(http, notifier).await;
        sync.request_delete_watcher("w1").await.unwrap();
        sync.unmount().await;
    }

    #[tokio::test]
    async fn set_listener_while_offline_notifies_error() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .returning(|_| Box::pin(async { Ok(empty_page()) }));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|n| n.level == NotificationLevel::Error)
            .times(1)
            .return_const(());

        let sync = mount_offline(http, notifier).await;
        let result = sync.request_clear_listener().await;

        assert!(matches!(result, Err(SyncError::NotConnected)));
        sync.unmount().await;
    }

    #[test]
    fn roster_parses_first_argument() {
        let roster = parse_roster(&[json!([
            {"id": "w1", "username": "mark", "platform": "twitter", "interaction": "tip"}
        ])])
        .unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "w1");
    }

    #[test]
    fn delete_feedback_by_outcome() {
        let done = delete_notification(DeleteScope::All, &Ok(())).unwrap();
        assert_eq!(done.level, NotificationLevel::Success);
        assert_eq!(done.message, ALL_WATCHERS_DELETED);

        let unauthorized = Err(ApiError::new("Delete failed", 401));
        assert!(delete_notification(DeleteScope::One, &unauthorized).is_none());

        let blank = Err(ApiError::new("", 500));
        let failed = delete_notification(DeleteScope::One, &blank).unwrap();
        assert_eq!(failed.level, NotificationLevel::Error);
        assert_eq!(failed.message, DELETE_WATCHER_FALLBACK);

        let server = Err(ApiError::new("Watcher not found", 404));
        let failed = delete_notification(DeleteScope::One, &server).unwrap();
        assert_eq!(failed.message, "Watcher not found");
    }

    #[test]
    fn roster_push_without_arguments_is_rejected() {
        assert!(matches!(parse_roster(&[]), Err(SyncError::Protocol(_))));
        assert!(parse_roster(&[json!([])]).unwrap().is_empty());
    }

    #[test]
    fn roster_with_unknown_platform_is_rejected() {
        let result = parse_roster(&[json!([
            {"id": "w1", "username": "mark", "platform": "myspace", "interaction": "tip"}
        ])]);
        assert!(result.is_err());
    }

    #[test]
    fn listener_target_from_object_or_pair() {
        let from_object =
            parse_listener_target(&[json!({"videoId": "abc", "streamlabsToken": "t"})]).unwrap();
        let from_pair = parse_listener_target(&[json!("abc"), json!("t")]).unwrap();
        assert_eq!(from_object, from_pair);
        assert!(parse_listener_target(&[]).is_err());
    }
}
