//! Watcher Sync
//!
//! Client-side synchronization core for the watcher dashboard. Keeps a live
//! subscription to the watcher hub, merges pushed rosters with paginated
//! REST queries and publishes a read model that survives reconnects and
//! token expiry.

pub mod api;
pub mod channel;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod io;
pub mod notifier;
pub mod protocol;
pub mod state;
pub mod sync;
pub mod types;

pub use api::{ApiClient, ApiResult, LogSessionHandler, SessionHandler, LOGIN_ROUTE};
pub use channel::{PendingCompletion, PushChannel};
pub use config::{load_config, Config};
pub use connection::TokenSupplier;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{ApiError, Result, SyncError};
pub use notifier::{LogNotifier, Notification, NotificationLevel, Notifier};
pub use state::{Effect, QueryOutcome, QueryTicket, SyncCore, WatcherSnapshot};
pub use sync::{delete_notification, DeleteScope, WatcherSync};
pub use types::{
    ConnectionState, Interaction, ListenerTarget, PageResult, Platform, Watcher, WatcherQuery,
};
