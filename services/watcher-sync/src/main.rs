use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn, Level};
use watcher_sync::io::ReqwestHttpClient;
use watcher_sync::{
    delete_notification, load_config, ApiClient, ApiResult, Config, ConnectionState, DeleteScope,
    FileCredentialStore, LogNotifier, LogSessionHandler, Notifier, PushChannel, WatcherQuery,
    WatcherSnapshot, WatcherSync,
};

#[derive(Parser)]
#[command(name = "watcher-sync")]
#[command(about = "Live watcher dashboard client")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dashboard server base URL (overrides the config file)
    #[arg(long)]
    base_url: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info", value_parser = clap::value_parser!(Level))]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the access token
    Login {
        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,
    },

    /// Forget the stored access token
    Logout,

    /// Show one page of watchers
    Watchers {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Delete one watcher
    Delete {
        /// Watcher id
        id: String,
    },

    /// Delete every watcher
    DeleteAll,

    /// Print the plain-text export
    Export,

    /// Mount the sync core and log every change (press Ctrl+C to stop)
    Monitor {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Point the server-side listener at a video
    SetListener {
        video_id: String,

        /// Streamlabs socket token
        token: String,
    },

    /// Reset the server-side listener to "not set"
    ClearListener,
}

#[derive(clap::Args)]
struct QueryArgs {
    /// Page number, starting at 1
    #[arg(long, default_value = "1")]
    page: u32,

    /// Rows per page (default from config)
    #[arg(long)]
    page_size: Option<u32>,

    /// Username prefix filter
    #[arg(long, default_value = "")]
    search: String,

    /// Sort column
    #[arg(long, default_value = "")]
    sort_by: String,
}

impl QueryArgs {
    fn to_query(&self, config: &Config) -> WatcherQuery {
        WatcherQuery::new(self.page, self.page_size.unwrap_or(config.query.page_size))
            .with_prefix(self.search.clone())
            .with_sort_by(self.sort_by.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let mut config = if let Some(config_path) = &args.config {
        debug!("Loading configuration from {:?}", config_path);
        load_config(config_path)?
    } else {
        Config::default()
    };
    if let Some(base_url) = args.base_url {
        config.server.base_url = base_url;
    }
    debug!(
        "Using server {} (hub {})",
        config.server.base_url,
        config.server.hub_url()
    );

    let api = Arc::new(ApiClient::new(
        &config.server.base_url,
        Arc::new(ReqwestHttpClient::new(config.server.request_timeout())?),
        Arc::new(FileCredentialStore::new(config.credentials.path.clone())),
        Arc::new(LogSessionHandler),
    )?);

    match args.command {
        Commands::Login { username, password } => {
            api.login(&username, &password).await?;
            info!("Logged in as {}", username);
        }
        Commands::Logout => {
            api.logout()?;
            info!("Logged out");
        }
        Commands::Watchers { query } => {
            let page = api.get_watchers(&query.to_query(&config)).await?;
            for watcher in &page.data {
                println!(
                    "{}\t{}\t{}\t{}",
                    watcher.id, watcher.username, watcher.platform, watcher.interaction
                );
            }
            println!(
                "page {}/{} ({} watchers)",
                page.page, page.total_pages, page.total_items
            );
        }
        Commands::Delete { id } => {
            let result = api.delete_watcher(&id).await;
            report_delete(DeleteScope::One, result)?;
        }
        Commands::DeleteAll => {
            let result = api.delete_all_watchers().await;
            report_delete(DeleteScope::All, result)?;
        }
        Commands::Export => {
            print!("{}", api.export_plaintext().await?);
        }
        Commands::Monitor { query } => {
            let sync = mount(&config, api, query.to_query(&config)).await;
            run_monitor(&sync).await;
            sync.unmount().await;
        }
        Commands::SetListener { video_id, token } => {
            let sync = mount(&config, api, WatcherQuery::default()).await;
            let result = match wait_connected(&sync, &config).await {
                Ok(()) => sync.request_set_listener(&video_id, &token).await,
                Err(e) => Err(e),
            };
            sync.unmount().await;
            result?;
        }
        Commands::ClearListener => {
            let sync = mount(&config, api, WatcherQuery::default()).await;
            let result = match wait_connected(&sync, &config).await {
                Ok(()) => sync.request_clear_listener().await,
                Err(e) => Err(e),
            };
            sync.unmount().await;
            result?;
        }
    }

    Ok(())
}

fn report_delete(scope: DeleteScope, result: ApiResult<()>) -> ApiResult<()> {
    if let Some(notification) = delete_notification(scope, &result) {
        LogNotifier.notify(notification);
    }
    result
}

async fn mount(config: &Config, api: Arc<ApiClient>, query: WatcherQuery) -> WatcherSync {
    WatcherSync::mount(
        PushChannel::new(config.channel.clone()),
        api,
        Arc::new(LogNotifier),
        config.server.hub_url(),
        query,
    )
    .await
}

async fn wait_connected(sync: &WatcherSync, config: &Config) -> watcher_sync::Result<()> {
    let timeout = Duration::from_secs(config.channel.connection_timeout_seconds);
    let mut snapshots = sync.subscribe();
    let reached = tokio::time::timeout(
        timeout,
        snapshots.wait_for(|snapshot| snapshot.connected),
    )
    .await;
    match reached {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(watcher_sync::SyncError::Closed),
        Err(_) => Err(watcher_sync::SyncError::Timeout(
            "Push channel did not connect".to_string(),
        )),
    }
}

async fn run_monitor(sync: &WatcherSync) {
    info!("Monitoring watchers (press Ctrl+C to stop)...");

    let mut snapshots = sync.subscribe();
    print_snapshot(&snapshots.borrow_and_update());

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("Sync loop stopped");
                    break;
                }
                print_snapshot(&snapshots.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }
}

fn print_snapshot(snapshot: &WatcherSnapshot) {
    let health = match snapshot.connection {
        ConnectionState::Connected => "live",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Reconnecting => "reconnecting",
        ConnectionState::Disconnected => "offline",
    };
    let last_added = snapshot
        .last_added
        .as_ref()
        .map(|w| format!("{} ({} on {})", w.username, w.interaction, w.platform))
        .unwrap_or_else(|| "-".to_string());
    let listener = snapshot
        .listener_target
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        "[{}] roster={} current users={} last added={} listener: {}",
        health,
        snapshot.roster.len(),
        snapshot.current_users,
        last_added,
        listener
    );
}
