//! Message State Machine
//!
//! A [`Message`] moves through `queued → sending → streaming → sent | failed`.
//! All mutation of a live message goes through [`Message::apply`], which
//! consults the transition table below; anything not in the table is ignored
//! with a warning, since late network callbacks can arrive after a message
//! has already reached a terminal state.
//!
//! ```text
//!   queued ──DispatchStarted──▶ sending ──ContentDelta──▶ streaming ◀─┐
//!     │                           │  │                      │  │      │
//!     │                           │  └─FullResponse/──▶ sent ◀┘  └─ContentDelta
//!     │                           │    StreamComplete        StreamComplete
//!     └──Failed──▶ failed ◀──Failed┘◀──────────Failed──────────┘
//! ```
//!
//! `sent` and `failed` are terminal. Retrying a failed message means
//! creating a new one.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorDetail, GatewayError};
use crate::ids::{MessageId, ProviderId};

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The person using the app
    User,
    /// A provider's reply
    Assistant,
}

/// Lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created, dispatch not yet started
    Queued,
    /// HTTP request issued, nothing received yet
    Sending,
    /// Receiving content deltas
    Streaming,
    /// Completed successfully
    Sent,
    /// Completed with an error
    Failed,
}

impl MessageStatus {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// Input to the state machine
#[derive(Clone, Debug, PartialEq)]
pub enum MessageEvent {
    /// The HTTP request is about to be issued
    DispatchStarted,
    /// Incremental content
    ContentDelta(String),
    /// Complete non-streaming response
    FullResponse(String),
    /// End-of-stream sentinel seen
    StreamComplete,
    /// Any classified failure (validation, network, HTTP, stream, timeout)
    Failed(GatewayError),
}

impl MessageEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::DispatchStarted => "dispatch_started",
            Self::ContentDelta(_) => "content_delta",
            Self::FullResponse(_) => "full_response",
            Self::StreamComplete => "stream_complete",
            Self::Failed(_) => "failed",
        }
    }
}

/// A successful state change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Status before
    pub from: MessageStatus,
    /// Status after
    pub to: MessageStatus,
}

impl Transition {
    /// Whether the status actually changed (deltas keep `streaming`)
    #[must_use]
    pub fn changed_status(&self) -> bool {
        self.from != self.to
    }
}

/// A conversation message
///
/// Field names on the wire are stable: `id`, `role`, `content`, `status`,
/// `providerSource`, `timestamp`, `isStreaming`, `errorDetail`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    id: MessageId,
    role: MessageRole,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_source: Option<ProviderId>,
    status: MessageStatus,
    #[serde(rename = "timestamp")]
    created_at: u64,
    #[serde(default)]
    is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_detail: Option<ErrorDetail>,
}

impl Message {
    /// A user message; complete as soon as it exists
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::User,
            content: content.into(),
            provider_source: None,
            status: MessageStatus::Sent,
            created_at: now_ms(),
            is_streaming: false,
            error_detail: None,
        }
    }

    /// A queued assistant message for `provider`
    #[must_use]
    pub fn assistant(provider: ProviderId) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Assistant,
            content: String::new(),
            provider_source: Some(provider),
            status: MessageStatus::Queued,
            created_at: now_ms(),
            is_streaming: false,
            error_detail: None,
        }
    }

    /// Same message under a caller-chosen id
    #[must_use]
    pub(crate) fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Message id
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Author
    #[must_use]
    pub fn role(&self) -> MessageRole {
        self.role
    }

    /// Current content
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Provider that produced an assistant message
    #[must_use]
    pub fn provider_source(&self) -> Option<&ProviderId> {
        self.provider_source.as_ref()
    }

    /// Lifecycle state
    #[must_use]
    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// Creation time (Unix ms)
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// True exactly while the status is `streaming`
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    /// Failure record, for failed messages
    #[must_use]
    pub fn error_detail(&self) -> Option<&ErrorDetail> {
        self.error_detail.as_ref()
    }

    /// Whether the message reached `sent` or `failed`
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy with replaced content: the explicit user-edit path
    ///
    /// Only the History Store calls this, so edits land in the canonical
    /// sequence rather than in someone's local copy.
    pub(crate) fn edited(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    /// Feed one event through the transition table
    ///
    /// Returns the transition when applied, `None` (after logging) when the
    /// event is not valid in the current state.
    pub fn apply(&mut self, event: MessageEvent) -> Option<Transition> {
        use MessageStatus::{Failed, Queued, Sending, Sent, Streaming};

        let from = self.status;
        let to = match (from, &event) {
            (Queued, MessageEvent::DispatchStarted) => Sending,
            (Sending | Streaming, MessageEvent::ContentDelta(_)) => Streaming,
            (Sending, MessageEvent::FullResponse(_)) => Sent,
            (Sending | Streaming, MessageEvent::StreamComplete) => Sent,
            (Queued | Sending | Streaming, MessageEvent::Failed(_)) => Failed,
            _ => {
                tracing::warn!(
                    message_id = %self.id,
                    status = ?from,
                    event = event.name(),
                    "Ignoring invalid message transition"
                );
                return None;
            }
        };

        match event {
            MessageEvent::ContentDelta(delta) => self.content.push_str(&delta),
            MessageEvent::FullResponse(content) => self.content = content,
            MessageEvent::Failed(error) => {
                let explanation = error.user_message();
                if self.content.is_empty() {
                    self.content = explanation;
                } else {
                    self.content.push_str("\n\n");
                    self.content.push_str(&explanation);
                }
                self.error_detail = Some(error.detail());
            }
            MessageEvent::DispatchStarted | MessageEvent::StreamComplete => {}
        }

        self.status = to;
        self.is_streaming = to == Streaming;
        Some(Transition { from, to })
    }
}

/// Current timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
