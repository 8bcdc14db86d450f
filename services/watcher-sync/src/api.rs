//! REST client for the dashboard API
//!
//! Every authenticated call reads the bearer token from the credential
//! store. A 401 answer clears the token and hands control to the
//! [`SessionHandler`] once; callers only see the normalized [`ApiError`].

use std::sync::Arc;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::credentials::CredentialStore;
use crate::error::ApiError;
use crate::io::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use crate::types::{LoginRequest, LoginResponse, PageResult, WatcherQuery};

/// Route the session handler sends the user to after a 401
pub const LOGIN_ROUTE: &str = "/login";

const QUERY_FAILED: &str = "Watcher failed";
const DELETE_FAILED: &str = "Delete failed";
const DELETE_ALL_FAILED: &str = "No watchers found to delete.";
const LOGIN_FAILED: &str = "Login failed";
const EXPORT_FAILED: &str = "Export failed";

/// Result of a REST call
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Called when the server rejects the session token
#[cfg_attr(test, mockall::automock)]
pub trait SessionHandler: Send + Sync {
    /// The token has already been cleared; navigate to `route`
    fn session_expired(&self, route: &str);
}

/// Session handler that only logs the redirect
#[derive(Debug, Default, Clone)]
pub struct LogSessionHandler;

impl SessionHandler for LogSessionHandler {
    fn session_expired(&self, route: &str) {
        warn!("Session expired, log in again ({})", route);
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Client for the dashboard's REST endpoints
pub struct ApiClient {
    base_url: Url,
    http: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialStore>,
    session: Arc<dyn SessionHandler>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        http: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialStore>,
        session: Arc<dyn SessionHandler>,
    ) -> crate::Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            crate::SyncError::Config(format!("Invalid base URL {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(crate::SyncError::Config(format!(
                "Base URL {} cannot carry a path",
                base_url
            )));
        }
        Ok(Self {
            base_url,
            http,
            credentials,
            session,
        })
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Exchange credentials for tokens and store the access token
    ///
    /// A 401 here means bad credentials, not an expired session, so it is
    /// returned to the caller without redirecting.
    pub async fn login(&self, username: &str, password: &str) -> ApiResult<LoginResponse> {
        let body = serde_json::to_value(LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })
        .map_err(|_| ApiError::unexpected())?;
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: self.url(&["login"], None),
            bearer: None,
            json_body: Some(body),
        };

        let response = self.send(request, LOGIN_FAILED).await?;
        if !response.is_success() {
            return Err(error_from_response(&response, LOGIN_FAILED));
        }

        let tokens: LoginResponse = parse_body(&response)?;
        self.credentials.set_token(&tokens.access_token).map_err(|e| {
            warn!("Failed to store access token: {}", e);
            ApiError::unexpected()
        })?;
        debug!("Logged in as {}", username);
        Ok(tokens)
    }

    /// Forget the stored token
    pub fn logout(&self) -> crate::Result<()> {
        self.credentials.clear()
    }

    /// Fetch one page of watchers
    pub async fn get_watchers(&self, query: &WatcherQuery) -> ApiResult<PageResult> {
        let query = query.clone().normalized();
        let url = self.url(&["dashboard", "watchers"], Some(&query.to_query_pairs()));
        let response = self
            .authenticated(HttpMethod::Get, url, QUERY_FAILED)
            .await?;
        parse_body(&response)
    }

    pub async fn delete_watcher(&self, id: &str) -> ApiResult<()> {
        let url = self.url(&["dashboard", "watchers", id], None);
        self.authenticated(HttpMethod::Delete, url, DELETE_FAILED)
            .await?;
        Ok(())
    }

    pub async fn delete_all_watchers(&self) -> ApiResult<()> {
        let url = self.url(&["dashboard", "watchers"], None);
        self.authenticated(HttpMethod::Delete, url, DELETE_ALL_FAILED)
            .await?;
        Ok(())
    }

    /// Plain-text export of every watcher
    pub async fn export_plaintext(&self) -> ApiResult<String> {
        let url = self.url(&["dashboard", "watchers", "plaintext"], None);
        let response = self
            .authenticated(HttpMethod::Get, url, EXPORT_FAILED)
            .await?;
        Ok(response.body)
    }

    async fn authenticated(
        &self,
        method: HttpMethod,
        url: String,
        default_message: &str,
    ) -> ApiResult<HttpResponse> {
        let request = HttpRequest {
            method,
            url,
            bearer: self.credentials.get_token(),
            json_body: None,
        };

        let response = self.send(request, default_message).await?;
        if response.status == 401 {
            self.expire_session();
        }
        if !response.is_success() {
            return Err(error_from_response(&response, default_message));
        }
        Ok(response)
    }

    async fn send(&self, request: HttpRequest, default_message: &str) -> ApiResult<HttpResponse> {
        self.http.execute(request).await.map_err(|e| {
            debug!("{}: {}", default_message, e);
            ApiError::new(default_message, 500)
        })
    }

    fn expire_session(&self) {
        if let Err(e) = self.credentials.clear() {
            warn!("Failed to clear rejected token: {}", e);
        }
        self.session.session_expired(LOGIN_ROUTE);
    }

    fn url(&self, segments: &[&str], query: Option<&[(&'static str, String)]>) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if let Some(pairs) = query {
            url.query_pairs_mut()
                .extend_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())));
        }
        url.into()
    }
}

fn error_from_response(response: &HttpResponse, default_message: &str) -> ApiError {
    let message = serde_json::from_str::<ErrorBody>(&response.body)
        .ok()
        .and_then(|body| body.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| default_message.to_string());
    ApiError::new(message, response.status)
}

fn parse_body<T: DeserializeOwned>(response: &HttpResponse) -> ApiResult<T> {
    serde_json::from_str(&response.body).map_err(|e| {
        debug!("Unexpected response body: {}", e);
        ApiError::unexpected()
    })
}
