//! Request Builder
//!
//! Turns `(provider, conversation context, credential)` into a
//! [`ProviderRequest`]. Building is pure: no I/O, no clock, no globals. The
//! body and endpoint come from the provider's [`ProviderSchema`]; the
//! builder only adds the parts every schema shares (content negotiation and
//! credential placement).
//!
//! [`ProviderSchema`]: crate::schema::ProviderSchema

use std::fmt;

use serde_json::Value;

use crate::error::GatewayError;
use crate::ids::ProviderId;
use crate::message::{Message, MessageRole, MessageStatus};
use crate::provider::{AuthScheme, Provider};

/// One prior turn passed to the model
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextMessage {
    /// Author
    pub role: MessageRole,
    /// Text
    pub content: String,
}

/// Everything the model sees for one dispatch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationContext {
    /// System prompt (optional)
    pub system_prompt: Option<String>,
    /// Prior turns, oldest first
    pub history: Vec<ContextMessage>,
    /// The new user message
    pub user_message: String,
}

impl ConversationContext {
    /// Context with no history
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            ..Default::default()
        }
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    /// Build the context for `provider` from stored history
    ///
    /// Only `sent` messages are used. Assistant replies are kept only when
    /// they came from `provider`, so in a fan-out conversation each provider
    /// sees its own previous answers and not its siblings'. At most
    /// `max_messages` of the most recent turns are kept (0 = unlimited).
    #[must_use]
    pub fn from_history(
        messages: &[Message],
        provider: &ProviderId,
        max_messages: usize,
        user_message: impl Into<String>,
    ) -> Self {
        let eligible: Vec<ContextMessage> = messages
            .iter()
            .filter(|m| m.status() == MessageStatus::Sent)
            .filter(|m| match m.role() {
                MessageRole::User => true,
                MessageRole::Assistant => m.provider_source() == Some(provider),
            })
            .map(|m| ContextMessage {
                role: m.role(),
                content: m.content().to_string(),
            })
            .collect();

        let start = if max_messages == 0 {
            0
        } else {
            eligible.len().saturating_sub(max_messages)
        };

        Self {
            system_prompt: None,
            history: eligible[start..].to_vec(),
            user_message: user_message.into(),
        }
    }
}

/// Sampling parameters shared by every schema
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerationParams {
    /// Maximum tokens in the reply (0 = provider default)
    pub max_tokens: u32,
    /// Temperature (0.0-2.0)
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 0,
            temperature: 0.7,
        }
    }
}

/// Where the credential goes on the wire
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialPlacement {
    /// Request header
    Header {
        /// Header name
        name: String,
        /// Header value
        value: String,
    },
    /// URL query parameter
    Query {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },
}

impl fmt::Debug for CredentialPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header { name, .. } => write!(f, "Header({name}: <redacted>)"),
            Self::Query { name, .. } => write!(f, "Query({name}=<redacted>)"),
        }
    }
}

/// A fully built HTTP request
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    /// Target provider
    pub provider: ProviderId,
    /// Absolute URL
    pub url: String,
    /// Non-secret headers
    pub headers: Vec<(String, String)>,
    /// Credential, kept apart so `Debug` never prints it
    pub credential: Option<CredentialPlacement>,
    /// JSON body
    pub body: Value,
    /// Whether the response is an event stream
    pub stream: bool,
}

impl ProviderRequest {
    /// Look up a non-secret header (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Builds provider requests
#[derive(Clone, Debug, Default)]
pub struct RequestBuilder {
    params: GenerationParams,
}

impl RequestBuilder {
    /// Create with the given sampling parameters
    #[must_use]
    pub fn new(params: GenerationParams) -> Self {
        Self { params }
    }

    /// Sampling parameters in use
    #[must_use]
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Check that a credential is present when the provider needs one
    pub fn validate_credential(
        provider: &Provider,
        credential: Option<&str>,
    ) -> Result<(), GatewayError> {
        let present = credential.is_some_and(|c| !c.trim().is_empty());
        if provider.auth_scheme.requires_credential() && !present {
            return Err(GatewayError::MissingCredential {
                provider: provider.id.clone(),
            });
        }
        Ok(())
    }

    /// Build the request for one dispatch
    pub fn build(
        &self,
        provider: &Provider,
        context: &ConversationContext,
        credential: Option<&str>,
    ) -> Result<ProviderRequest, GatewayError> {
        Self::validate_credential(provider, credential)?;

        let schema = provider.kind.schema();
        let stream = provider.supports_streaming;

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        headers.push((
            "Accept".to_string(),
            if stream {
                "text/event-stream".to_string()
            } else {
                "application/json".to_string()
            },
        ));
        headers.extend(schema.extra_headers());

        let credential = match (&provider.auth_scheme, credential) {
            (AuthScheme::None, _) | (_, None) => None,
            (AuthScheme::Bearer, Some(key)) => Some(CredentialPlacement::Header {
                name: "Authorization".to_string(),
                value: format!("Bearer {}", key.trim()),
            }),
            (AuthScheme::Header { name }, Some(key)) => Some(CredentialPlacement::Header {
                name: name.clone(),
                value: key.trim().to_string(),
            }),
            (AuthScheme::QueryParam { name }, Some(key)) => Some(CredentialPlacement::Query {
                name: name.clone(),
                value: key.trim().to_string(),
            }),
        };

        Ok(ProviderRequest {
            provider: provider.id.clone(),
            url: schema.endpoint(provider, stream),
            headers,
            credential,
            body: schema.body(provider, context, &self.params, stream),
            stream,
        })
    }
}
