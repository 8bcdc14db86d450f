//! Data types shared by the REST layer, the push channel and the sync core

use serde::{Deserialize, Serialize};

/// Streaming platform a watcher interacted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Facebook,
    Twitter,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Youtube => write!(f, "youtube"),
            Platform::Facebook => write!(f, "facebook"),
            Platform::Twitter => write!(f, "twitter"),
        }
    }
}

/// Kind of viewer interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Interaction {
    Comment,
    Tip,
    Subscription,
    MembershipGift,
    Superchat,
}

impl std::fmt::Display for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interaction::Comment => write!(f, "comment"),
            Interaction::Tip => write!(f, "tip"),
            Interaction::Subscription => write!(f, "subscription"),
            Interaction::MembershipGift => write!(f, "membershipGift"),
            Interaction::Superchat => write!(f, "superchat"),
        }
    }
}

/// One tracked viewer interaction. Treated as immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    pub id: String,
    pub username: String,
    pub platform: Platform,
    pub interaction: Interaction,
}

/// One page of watchers as returned by `GET /dashboard/watchers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub data: Vec<Watcher>,
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u32,
}

/// Parameters of a paginated watcher query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherQuery {
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub sort_by: String,
}

impl Default for WatcherQuery {
    fn default() -> Self {
        Self {
            page: Self::DEFAULT_PAGE,
            page_size: Self::DEFAULT_PAGE_SIZE,
            prefix: String::new(),
            sort_by: String::new(),
        }
    }
}

impl WatcherQuery {
    pub const DEFAULT_PAGE: u32 = 1;
    pub const DEFAULT_PAGE_SIZE: u32 = 10;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            ..Default::default()
        }
        .normalized()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_sort_by(mut self, sort_by: impl Into<String>) -> Self {
        self.sort_by = sort_by.into();
        self
    }

    /// Replace zero page numbers or sizes with the defaults
    pub fn normalized(mut self) -> Self {
        if self.page == 0 {
            self.page = Self::DEFAULT_PAGE;
        }
        if self.page_size == 0 {
            self.page_size = Self::DEFAULT_PAGE_SIZE;
        }
        self
    }

    /// Query-string pairs in the order the server expects them
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("page", self.page.to_string()),
            ("pageSize", self.page_size.to_string()),
            ("prefix", self.prefix.clone()),
            ("sortBy", self.sort_by.clone()),
        ]
    }
}

/// Server-side listener configuration, echoed back over the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTarget {
    pub video_id: String,
    #[serde(alias = "token")]
    pub streamlabs_token: String,
}

impl ListenerTarget {
    /// Value the server treats as "no listener configured"
    pub const UNSET: &'static str = "0";

    pub fn new(video_id: impl Into<String>, streamlabs_token: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            streamlabs_token: streamlabs_token.into(),
        }
    }

    pub fn cleared() -> Self {
        Self::new(Self::UNSET, Self::UNSET)
    }

    pub fn video_id(&self) -> Option<&str> {
        display_value(&self.video_id)
    }

    pub fn streamlabs_token(&self) -> Option<&str> {
        display_value(&self.streamlabs_token)
    }

    pub fn is_set(&self) -> bool {
        self.video_id().is_some()
    }
}

impl std::fmt::Display for ListenerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "video {}, streamlabs token {}",
            self.video_id().unwrap_or("not set"),
            if self.streamlabs_token().is_some() {
                "set"
            } else {
                "not set"
            }
        )
    }
}

fn display_value(value: &str) -> Option<&str> {
    if value.is_empty() || value == ListenerTarget::UNSET {
        None
    } else {
        Some(value)
    }
}

/// Lifecycle of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    #[default]
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Body of `POST /login`
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Tokens issued by `POST /login`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
}
