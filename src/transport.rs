//! HTTP transport seam.
//!
//! The core never talks to `reqwest` directly; it goes through [`Transport`],
//! which issues requests and hands back the response body as a byte stream.
//! Dropping the stream releases the underlying connection.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use tracing::debug;

use crate::error::TransportError;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A response whose headers have arrived; the body is read lazily.
pub struct StreamingReply {
    pub status: u16,
    pub body: ByteStream,
}

impl StreamingReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the whole body. Used for small payloads and error bodies.
    pub async fn collect(mut self) -> Result<Bytes, TransportError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }

    /// Best-effort error body for diagnostics.
    pub async fn error_text(self) -> String {
        match self.collect().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(_) => "Failed to read error body".to_string(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// `GET path`. `timeout` bounds the wait for the response headers.
    async fn get(&self, path: &str, timeout: Duration) -> Result<StreamingReply, TransportError>;

    /// `POST path` with a JSON body. `first_byte_timeout` bounds the wait for
    /// the response headers; `None` waits until the backend answers.
    async fn post_json(
        &self,
        path: &str,
        body: Vec<u8>,
        first_byte_timeout: Option<Duration>,
    ) -> Result<StreamingReply, TransportError>;
}

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        request: reqwest::RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<StreamingReply, TransportError> {
        let pending = request.send();
        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => pending.await,
        }
        .map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        debug!(status, url = %response.url(), "response headers received");
        let body = response
            .bytes_stream()
            .map(|item| item.map_err(|e| TransportError::Body(e.to_string())))
            .boxed();
        Ok(StreamingReply { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str, timeout: Duration) -> Result<StreamingReply, TransportError> {
        Self::send(self.client.get(self.url(path)), Some(timeout)).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: Vec<u8>,
        first_byte_timeout: Option<Duration>,
    ) -> Result<StreamingReply, TransportError> {
        let request = self
            .client
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        Self::send(request, first_byte_timeout).await
    }
}
