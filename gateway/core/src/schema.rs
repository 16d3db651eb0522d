//! Wire schemas
//!
//! Each [`ProviderKind`] maps to exactly one [`ProviderSchema`]. The schema
//! knows the endpoint layout, the request body shape, how to read a
//! non-streaming completion and how to interpret one decoded stream record.
//! Supporting a new family of APIs means adding a variant and a schema here;
//! call sites never branch on provider ids.

use serde_json::{json, Value};

use crate::message::MessageRole;
use crate::provider::{Provider, ProviderKind};
use crate::request::{ConversationContext, GenerationParams};

/// Meaning of one decoded stream record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamRecord {
    /// Incremental text
    Delta(String),
    /// Valid record without content (role-only frames, pings, usage)
    Empty,
    /// Schema-level end of stream
    Done,
    /// Upstream error embedded in the stream
    Error(String),
}

/// Provider-family specific request/response handling
pub trait ProviderSchema: Send + Sync {
    /// Request URL (without credentials)
    fn endpoint(&self, provider: &Provider, stream: bool) -> String;

    /// Fixed headers the family requires
    fn extra_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// JSON request body
    fn body(
        &self,
        provider: &Provider,
        context: &ConversationContext,
        params: &GenerationParams,
        stream: bool,
    ) -> Value;

    /// Interpret one `data:` payload
    fn interpret(&self, record: &Value) -> StreamRecord {
        interpret_generic(record)
    }

    /// Completion text of a non-streaming response
    fn extract_completion(&self, response: &Value) -> Option<String>;
}

impl ProviderKind {
    /// The schema for this family
    #[must_use]
    pub fn schema(self) -> &'static dyn ProviderSchema {
        match self {
            Self::OpenAiCompatible => &OpenAiSchema,
            Self::Anthropic => &AnthropicSchema,
            Self::Gemini => &GeminiSchema,
        }
    }
}

/// OpenAI `/chat/completions` and compatible servers
pub struct OpenAiSchema;

impl ProviderSchema for OpenAiSchema {
    fn endpoint(&self, provider: &Provider, _stream: bool) -> String {
        format!("{}/chat/completions", provider.base_url)
    }

    fn body(
        &self,
        provider: &Provider,
        context: &ConversationContext,
        params: &GenerationParams,
        stream: bool,
    ) -> Value {
        let mut messages = Vec::with_capacity(context.history.len() + 2);
        if let Some(ref system) = context.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in &context.history {
            messages.push(json!({ "role": role_name(msg.role), "content": msg.content }));
        }
        messages.push(json!({ "role": "user", "content": context.user_message }));

        let mut body = json!({
            "model": provider.model,
            "messages": messages,
            "temperature": params.temperature,
            "stream": stream,
        });
        if params.max_tokens > 0 {
            body["max_tokens"] = json!(params.max_tokens);
        }
        body
    }

    fn extract_completion(&self, response: &Value) -> Option<String> {
        response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| extract_generic_completion(response))
    }
}

/// Anthropic Messages API
pub struct AnthropicSchema;

/// `anthropic-version` header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic rejects requests without `max_tokens`
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 1024;

impl ProviderSchema for AnthropicSchema {
    fn endpoint(&self, provider: &Provider, _stream: bool) -> String {
        format!("{}/messages", provider.base_url)
    }

    fn extra_headers(&self) -> Vec<(String, String)> {
        vec![("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string())]
    }

    fn body(
        &self,
        provider: &Provider,
        context: &ConversationContext,
        params: &GenerationParams,
        stream: bool,
    ) -> Value {
        let mut messages: Vec<Value> = context
            .history
            .iter()
            .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
            .collect();
        messages.push(json!({ "role": "user", "content": context.user_message }));

        let max_tokens = if params.max_tokens > 0 {
            params.max_tokens
        } else {
            ANTHROPIC_DEFAULT_MAX_TOKENS
        };

        let mut body = json!({
            "model": provider.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": params.temperature,
            "stream": stream,
        });
        if let Some(ref system) = context.system_prompt {
            body["system"] = json!(system);
        }
        body
    }

    fn interpret(&self, record: &Value) -> StreamRecord {
        match record.get("type").and_then(Value::as_str) {
            Some("message_stop") => StreamRecord::Done,
            Some("content_block_delta") => record
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map_or(StreamRecord::Empty, |t| StreamRecord::Delta(t.to_string())),
            Some("message_start" | "content_block_start" | "content_block_stop" | "message_delta" | "ping") => {
                StreamRecord::Empty
            }
            _ => interpret_generic(record),
        }
    }

    fn extract_completion(&self, response: &Value) -> Option<String> {
        let blocks = response.get("content").and_then(Value::as_array);
        match blocks {
            Some(blocks) => Some(
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect(),
            ),
            None => extract_generic_completion(response),
        }
    }
}

/// Google Gemini `generateContent`
pub struct GeminiSchema;

impl ProviderSchema for GeminiSchema {
    fn endpoint(&self, provider: &Provider, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                provider.base_url, provider.model
            )
        } else {
            format!("{}/models/{}:generateContent", provider.base_url, provider.model)
        }
    }

    fn body(
        &self,
        _provider: &Provider,
        context: &ConversationContext,
        params: &GenerationParams,
        _stream: bool,
    ) -> Value {
        let mut contents: Vec<Value> = context
            .history
            .iter()
            .map(|m| {
                let role = match m.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();
        contents.push(json!({ "role": "user", "parts": [{ "text": context.user_message }] }));

        let mut generation = json!({ "temperature": params.temperature });
        if params.max_tokens > 0 {
            generation["maxOutputTokens"] = json!(params.max_tokens);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if let Some(ref system) = context.system_prompt {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    fn extract_completion(&self, response: &Value) -> Option<String> {
        candidate_text(response).or_else(|| extract_generic_completion(response))
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

/// Shapes every schema accepts
///
/// - `{"error": "..."}` / `{"error": {"message": "..."}}`
/// - `{"choices": [{"delta": {"content": "..."}}]}`
/// - `{"delta": "..."}`, `{"delta": {"text" | "content": "..."}}`
/// - `{"candidates": [{"content": {"parts": [{"text": "..."}]}}]}`
/// - `{"content": "..."}`
pub fn interpret_generic(record: &Value) -> StreamRecord {
    if let Some(error) = record.get("error").filter(|e| !e.is_null()) {
        let message = error
            .as_str()
            .map(String::from)
            .or_else(|| error.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| error.to_string());
        return StreamRecord::Error(message);
    }

    let text = record
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| match record.get("delta") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(delta) => delta
                .get("text")
                .or_else(|| delta.get("content"))
                .and_then(Value::as_str)
                .map(String::from),
            None => None,
        })
        .or_else(|| candidate_text(record))
        .or_else(|| record.get("content").and_then(Value::as_str).map(String::from));

    match text {
        Some(t) if !t.is_empty() => StreamRecord::Delta(t),
        _ => StreamRecord::Empty,
    }
}

fn candidate_text(record: &Value) -> Option<String> {
    let parts = record
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)?;
    Some(
        parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
    )
}

fn extract_generic_completion(response: &Value) -> Option<String> {
    ["completion", "content", "response", "text"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_str))
        .map(String::from)
}
