//! I/O traits and implementations for the watcher sync client
//!
//! The REST layer talks through [`HttpClient`], the push channel through
//! [`ConnectionFactory`], [`FrameReader`] and [`FrameWriter`]. Tests replace
//! these with in-memory fakes; production uses reqwest and a WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Result, SyncError};

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// A fully resolved outbound request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub bearer: Option<String>,
    pub json_body: Option<serde_json::Value>,
}

/// HTTP response from a request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Abstraction over the HTTP client for dependency injection
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait HttpClient: Send + Sync {
    /// Send the request. Only transport failures are errors; any status
    /// code the server answers with is returned as a response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production HTTP client using reqwest
#[derive(Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Http(format!("Building HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}", request.method, request.url);
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            SyncError::Http(format!("{} {} failed: {}", request.method, request.url, e))
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Http(format!("Reading response body: {}", e)))?;

        debug!(
            "{} {} -> {} ({} bytes)",
            request.method,
            request.url,
            status,
            body.len()
        );
        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Push channel transport
// ============================================================================

/// Reader and writer halves of one push connection
pub struct ChannelConnection {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

/// Reads text frames from a connection
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait FrameReader: Send {
    /// `Ok(Some(frame))` for a text frame, `Ok(None)` once the peer closed
    async fn read_frame(&mut self) -> Result<Option<String>>;
}

/// Writes text frames to a connection
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &str) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// Opens push connections
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionFactory: Send + Sync {
    /// Connect to `url`, presenting `token` as a bearer credential when given
    async fn connect(
        &self,
        url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<ChannelConnection>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket implementation of FrameReader
pub struct WebSocketFrameReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WebSocketFrameReader {
    async fn read_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_string())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(SyncError::ConnectionFailed(format!(
                        "WebSocket read failed: {}",
                        e
                    )))
                }
            }
        }
    }
}

/// WebSocket implementation of FrameWriter
pub struct WebSocketFrameWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WebSocketFrameWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        self.sink
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| SyncError::SendError(e.to_string()))
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| SyncError::SendError(e.to_string()))
    }
}

/// WebSocket implementation of ConnectionFactory
#[derive(Default, Clone)]
pub struct WebSocketConnectionFactory;

impl WebSocketConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for WebSocketConnectionFactory {
    async fn connect(
        &self,
        url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<ChannelConnection> {
        debug!("Connecting to {} with timeout {:?}", url, timeout);

        let mut request = url
            .into_client_request()
            .map_err(|e| SyncError::ConnectionFailed(format!("Invalid hub URL {}: {}", url, e)))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
                SyncError::ConnectionFailed(format!("Token is not a valid header value: {}", e))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| SyncError::Timeout(format!("Connection to {} timed out", url)))?
                .map_err(|e| {
                    SyncError::ConnectionFailed(format!("Failed to connect to {}: {}", url, e))
                })?;

        debug!("WebSocket connection established to {}", url);

        let (sink, stream) = stream.split();
        Ok(ChannelConnection {
            reader: Box::new(WebSocketFrameReader { stream }),
            writer: Box::new(WebSocketFrameWriter { sink }),
        })
    }
}
