//! Error Classifier
//!
//! Every failure the gateway can surface is a [`GatewayError`], and every
//! `GatewayError` maps onto exactly one [`ErrorKind`] of a closed taxonomy.
//! Callers render failures from the kind plus the context carried alongside
//! it (provider id, HTTP status), never from raw transport errors.
//!
//! # Taxonomy
//!
//! | Kind | Raised when |
//! |---|---|
//! | `MissingCredential` | provider needs a key and the supplier has none |
//! | `UnsupportedProvider` | id is not in the registry |
//! | `NetworkFailure` | connect / send / body read failed |
//! | `NonSuccessStatus` | HTTP status outside 2xx |
//! | `MalformedResponse` | body could not be decoded |
//! | `StreamError` | upstream embedded an error record in the stream |
//! | `Timeout` | deadline exceeded or dispatch cancelled |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ProviderId;
use crate::transport::TransportError;

/// Longest body excerpt kept from a non-success HTTP response
pub const MAX_ERROR_BODY_CHARS: usize = 512;

/// Closed set of failure kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider requires a credential and none was supplied
    MissingCredential,
    /// Provider id is not registered
    UnsupportedProvider,
    /// Connection, request or body-read failure
    NetworkFailure,
    /// Server answered with a non-2xx status
    NonSuccessStatus,
    /// Response body could not be interpreted
    MalformedResponse,
    /// Error record embedded in the event stream
    StreamError,
    /// Deadline exceeded (also used for cancellation)
    Timeout,
}

impl ErrorKind {
    /// Short stable label, used in logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::UnsupportedProvider => "unsupported_provider",
            Self::NetworkFailure => "network_failure",
            Self::NonSuccessStatus => "non_success_status",
            Self::MalformedResponse => "malformed_response",
            Self::StreamError => "stream_error",
            Self::Timeout => "timeout",
        }
    }
}

/// Gateway failure with enough context to render an actionable message
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GatewayError {
    /// No credential for a provider that requires one
    #[error("no API key configured for provider {provider}")]
    MissingCredential {
        /// Provider that needs the key
        provider: ProviderId,
    },

    /// Provider id not present in the registry
    #[error("provider {provider} is not registered")]
    UnsupportedProvider {
        /// The unknown id
        provider: ProviderId,
    },

    /// Network-level failure
    #[error("network failure talking to {provider}: {message}")]
    NetworkFailure {
        /// Provider being called
        provider: ProviderId,
        /// Underlying error text
        message: String,
    },

    /// HTTP status outside the success range
    #[error("{provider} returned HTTP {status}: {body}")]
    NonSuccessStatus {
        /// Provider being called
        provider: ProviderId,
        /// HTTP status code
        status: u16,
        /// Truncated response body
        body: String,
    },

    /// Response body that could not be decoded
    #[error("malformed response from {provider}: {message}")]
    MalformedResponse {
        /// Provider being called
        provider: ProviderId,
        /// What was wrong with it
        message: String,
    },

    /// Error record reported inside the stream
    #[error("{provider} reported an error: {message}")]
    StreamError {
        /// Provider being called
        provider: ProviderId,
        /// Upstream error message
        message: String,
    },

    /// Deadline exceeded
    #[error("request to {provider} timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        /// Provider being called
        provider: ProviderId,
        /// How long the dispatch ran
        elapsed: Duration,
    },

    /// Dispatch cancelled by its conversation
    #[error("request to {provider} was cancelled")]
    Cancelled {
        /// Provider being called
        provider: ProviderId,
    },
}

impl GatewayError {
    /// Classify into the closed taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCredential { .. } => ErrorKind::MissingCredential,
            Self::UnsupportedProvider { .. } => ErrorKind::UnsupportedProvider,
            Self::NetworkFailure { .. } => ErrorKind::NetworkFailure,
            Self::NonSuccessStatus { .. } => ErrorKind::NonSuccessStatus,
            Self::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Self::StreamError { .. } => ErrorKind::StreamError,
            Self::Timeout { .. } | Self::Cancelled { .. } => ErrorKind::Timeout,
        }
    }

    /// Provider the failure belongs to
    #[must_use]
    pub fn provider(&self) -> &ProviderId {
        match self {
            Self::MissingCredential { provider }
            | Self::UnsupportedProvider { provider }
            | Self::NetworkFailure { provider, .. }
            | Self::NonSuccessStatus { provider, .. }
            | Self::MalformedResponse { provider, .. }
            | Self::StreamError { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Cancelled { provider } => provider,
        }
    }

    /// HTTP status, when the failure came from one
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NonSuccessStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying the same request could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkFailure { .. } | Self::Timeout { .. } => true,
            Self::NonSuccessStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Text shown to the user inside the failed message
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingCredential { provider } => {
                format!("Configure an API key for {provider} to use it.")
            }
            Self::UnsupportedProvider { provider } => {
                format!("{provider} is not an available provider.")
            }
            Self::NetworkFailure { provider, .. } => {
                format!("Could not reach {provider}. Check your network connection and try again.")
            }
            Self::NonSuccessStatus {
                provider, status, ..
            } => match status {
                401 | 403 => format!(
                    "{provider} rejected the API key (HTTP {status}). Check the key configured for {provider}."
                ),
                429 => format!("{provider} is rate limiting requests (HTTP 429). Try again shortly."),
                s if *s >= 500 => {
                    format!("{provider} is having trouble (HTTP {status}). Try again later.")
                }
                _ => format!("{provider} refused the request (HTTP {status})."),
            },
            Self::MalformedResponse { provider, .. } => {
                format!("{provider} sent a response that could not be read.")
            }
            Self::StreamError { provider, message } => format!("{provider} error: {message}"),
            Self::Timeout { provider, .. } => {
                format!("{provider} took too long to respond.")
            }
            Self::Cancelled { provider } => format!("Request to {provider} was cancelled."),
        }
    }

    /// Persistable summary of this failure
    #[must_use]
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind(),
            provider: self.provider().clone(),
            status: self.status(),
            message: self.to_string(),
        }
    }

    /// Classify a transport failure for `provider`
    #[must_use]
    pub fn from_transport(provider: &ProviderId, error: TransportError) -> Self {
        match error {
            TransportError::Timeout(_) => Self::Timeout {
                provider: provider.clone(),
                elapsed: Duration::ZERO,
            },
            TransportError::Connect(message)
            | TransportError::Request(message)
            | TransportError::Body(message) => Self::NetworkFailure {
                provider: provider.clone(),
                message,
            },
        }
    }

    /// Build a `NonSuccessStatus` error, truncating the body excerpt
    #[must_use]
    pub fn non_success(provider: &ProviderId, status: u16, body: &str) -> Self {
        Self::NonSuccessStatus {
            provider: provider.clone(),
            status,
            body: truncate_chars(body.trim(), MAX_ERROR_BODY_CHARS),
        }
    }
}

/// Failure record persisted with a failed message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Taxonomy kind
    pub kind: ErrorKind,
    /// Provider that failed
    pub provider: ProviderId,
    /// HTTP status, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Technical description
    pub message: String,
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
