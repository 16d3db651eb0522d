//! HTTP transport boundary
//!
//! The dispatcher talks to the network only through [`HttpTransport`]. The
//! production implementation is [`ReqwestTransport`]; tests substitute a
//! scripted transport so the whole pipeline runs without sockets.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

use crate::request::{CredentialPlacement, ProviderRequest};

/// Response body as a stream of arbitrarily sized chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Status plus body of an HTTP response
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Body chunks, in order
    pub body: ByteStream,
}

impl TransportResponse {
    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body into one buffer, stopping at `limit` bytes
    pub async fn collect_body(mut self, limit: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            let room = limit.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if buf.len() >= limit {
                break;
            }
        }
        Ok(buf)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Transport-level failures (classified into `GatewayError` by the caller)
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The client-side timeout fired
    #[error("timed out: {0}")]
    Timeout(String),
    /// Could not connect
    #[error("connection failed: {0}")]
    Connect(String),
    /// Request could not be sent
    #[error("request failed: {0}")]
    Request(String),
    /// Body read failed mid-stream
    #[error("body read failed: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Body(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Executes built requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue the request and return status plus streaming body
    async fn execute(&self, request: &ProviderRequest) -> Result<TransportResponse, TransportError>;
}

/// `reqwest`-backed transport
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create with a connect timeout
    ///
    /// No overall request timeout is set on the client: streams can run
    /// long, and the dispatcher enforces its own deadlines.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ProviderRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match &request.credential {
            Some(CredentialPlacement::Header { name, value }) => {
                builder = builder.header(name.as_str(), value.as_str());
            }
            Some(CredentialPlacement::Query { name, value }) => {
                builder = builder.query(&[(name.as_str(), value.as_str())]);
            }
            None => {}
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();

        Ok(TransportResponse { status, body })
    }
}
