//! Single-provider dispatch
//!
//! Runs one message through the whole pipeline for one provider:
//!
//! ```text
//!   queued ─▶ lookup ─▶ credential ─▶ build ─▶ sending ─▶ HTTP ─┬─▶ stream parser ─▶ streaming ─▶ sent
//!     │         │           │                                   └─▶ full body ─────────────────▶ sent
//!     └─────────┴───────────┴──── any failure, deadline or cancellation ─────────────────────▶ failed
//! ```
//!
//! Every dispatch ends in a terminal message, whatever happens: failures
//! are classified into [`GatewayError`] and applied to the message rather
//! than returned. The message is appended to history when it is created,
//! saved periodically while streaming, and saved again when terminal.
//!
//! Deadlines: `request_timeout` bounds the whole dispatch,
//! `stream_idle_timeout` bounds each wait for the next body chunk.

use std::sync::Arc;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::credentials::CredentialSupplier;
use crate::error::GatewayError;
use crate::events::GatewayEvent;
use crate::history::{HistoryError, HistoryStore};
use crate::ids::{ConversationId, MessageId, ProviderId};
use crate::message::{Message, MessageEvent, MessageStatus};
use crate::provider::{Provider, ProviderRegistry};
use crate::request::{ConversationContext, ProviderRequest, RequestBuilder};
use crate::streaming::{ParserEvent, StreamParser};
use crate::transport::{HttpTransport, TransportResponse};

/// Most bytes read from a non-2xx body for the error excerpt
const ERROR_BODY_LIMIT: usize = 8 * 1024;

/// Most bytes read from a non-streaming completion
const COMPLETION_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// One dispatch to one provider
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    /// Conversation the reply belongs to
    pub conversation_id: ConversationId,
    /// Target provider
    pub provider: ProviderId,
    /// Id of the assistant message this dispatch records
    pub message_id: MessageId,
    /// History before the new user message
    pub prior: Arc<[Message]>,
    /// The new user message
    pub query: String,
    /// Conversation-level cancellation
    pub cancel: CancellationToken,
}

/// Executes dispatches; cheap to clone
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    credentials: Arc<dyn CredentialSupplier>,
    transport: Arc<dyn HttpTransport>,
    history: Arc<HistoryStore>,
    builder: RequestBuilder,
    config: Arc<GatewayConfig>,
    events: broadcast::Sender<GatewayEvent>,
}

impl Dispatcher {
    /// Wire a dispatcher
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        credentials: Arc<dyn CredentialSupplier>,
        transport: Arc<dyn HttpTransport>,
        history: Arc<HistoryStore>,
        config: Arc<GatewayConfig>,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            registry,
            credentials,
            transport,
            history,
            builder: RequestBuilder::new(config.generation),
            config,
            events,
        }
    }

    /// Run one dispatch to completion
    ///
    /// Always returns a terminal (`sent` or `failed`) message.
    pub async fn dispatch(&self, request: DispatchRequest) -> Message {
        let conversation = &request.conversation_id;
        let provider = request.provider.clone();
        let mut message = Message::assistant(provider.clone()).with_id(request.message_id.clone());

        if let Err(e) = self.history.append(conversation, message.clone()).await {
            tracing::warn!(conversation = %conversation, error = %e, "Failed to record queued message");
        }
        self.emit(conversation, &message);

        let started = Instant::now();
        let timeout = self.config.request_timeout;

        let outcome = tokio::select! {
            biased;
            () = request.cancel.cancelled() => Err(GatewayError::Cancelled {
                provider: provider.clone(),
            }),
            result = tokio::time::timeout(timeout, self.exchange(&request, &mut message, started)) => {
                result.unwrap_or_else(|_| Err(GatewayError::Timeout {
                    provider: provider.clone(),
                    elapsed: started.elapsed(),
                }))
            }
        };

        if let Err(error) = outcome {
            tracing::warn!(
                provider = %provider,
                conversation = %conversation,
                kind = error.kind().as_str(),
                error = %error,
                "Dispatch failed"
            );
            self.transition(conversation, &mut message, MessageEvent::Failed(error));
        }

        if let Err(e) = self.history.update_message(conversation, &message).await {
            tracing::warn!(conversation = %conversation, error = %e, "Failed to persist message");
        }

        tracing::info!(
            provider = %provider,
            conversation = %conversation,
            status = ?message.status(),
            chars = message.content().len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Dispatch finished"
        );
        message
    }

    /// Record a failure for a dispatch that never returned its message
    ///
    /// Used when a dispatch task dies. The record the task left behind
    /// (queued or mid-stream) is marked failed in place; the failed
    /// message is appended only if the task died before recording one.
    pub async fn fail_detached(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        error: GatewayError,
    ) -> Message {
        let stored = match self.history.load(conversation).await {
            Ok(messages) => messages.into_iter().find(|m| m.id() == message_id),
            Err(e) => {
                tracing::warn!(conversation = %conversation, error = %e, "Failed to read dying dispatch");
                None
            }
        };
        let mut message = stored.unwrap_or_else(|| {
            Message::assistant(error.provider().clone()).with_id(message_id.clone())
        });
        self.transition(conversation, &mut message, MessageEvent::Failed(error));

        let saved = match self.history.update_message(conversation, &message).await {
            Err(HistoryError::MessageNotFound { .. }) => {
                self.history.append(conversation, message.clone()).await
            }
            other => other,
        };
        if let Err(e) = saved {
            tracing::warn!(conversation = %conversation, error = %e, "Failed to persist message");
        }
        message
    }

    async fn exchange(
        &self,
        request: &DispatchRequest,
        message: &mut Message,
        started: Instant,
    ) -> Result<(), GatewayError> {
        let conversation = &request.conversation_id;
        let provider = self.registry.lookup(&request.provider)?;

        let credential = self.credentials.get_credential(&provider.id);
        RequestBuilder::validate_credential(&provider, credential.as_deref())?;

        let context = self.context_for(request, &provider.id);
        let built = self
            .builder
            .build(&provider, &context, credential.as_deref())?;
        drop(credential);

        self.transition(conversation, message, MessageEvent::DispatchStarted);
        tracing::debug!(
            provider = %provider.id,
            url = %built.url,
            stream = built.stream,
            context_messages = context.history.len(),
            "Sending request"
        );

        let response = self
            .transport
            .execute(&built)
            .await
            .map_err(|e| GatewayError::from_transport(&provider.id, e))?;

        if !response.is_success() {
            let status = response.status;
            let body = response
                .collect_body(ERROR_BODY_LIMIT)
                .await
                .unwrap_or_default();
            return Err(GatewayError::non_success(
                &provider.id,
                status,
                &String::from_utf8_lossy(&body),
            ));
        }

        if built.stream {
            self.consume_stream(conversation, &provider, response, message, started)
                .await
        } else {
            self.consume_completion(conversation, &provider, &built, response, message)
                .await
        }
    }

    fn context_for(&self, request: &DispatchRequest, provider: &ProviderId) -> ConversationContext {
        let mut context = ConversationContext::from_history(
            &request.prior,
            provider,
            self.config.max_context_messages,
            request.query.clone(),
        );
        context.system_prompt.clone_from(&self.config.system_prompt);
        context
    }

    async fn consume_stream(
        &self,
        conversation: &ConversationId,
        provider: &Provider,
        response: TransportResponse,
        message: &mut Message,
        started: Instant,
    ) -> Result<(), GatewayError> {
        let mut parser =
            StreamParser::new(provider.kind).with_max_line_bytes(self.config.max_line_bytes);
        let mut body = response.body;
        let idle = self.config.stream_idle_timeout;
        let persist_every = self.config.stream_persist_interval;
        let mut last_persist = Instant::now();

        loop {
            let next = tokio::time::timeout(idle, body.next())
                .await
                .map_err(|_| GatewayError::Timeout {
                    provider: provider.id.clone(),
                    elapsed: started.elapsed(),
                })?;

            let (events, eof) = match next {
                Some(Ok(chunk)) => {
                    let events = parser.feed(&chunk).map_err(|e| GatewayError::MalformedResponse {
                        provider: provider.id.clone(),
                        message: e.to_string(),
                    })?;
                    (events, false)
                }
                Some(Err(e)) => return Err(GatewayError::from_transport(&provider.id, e)),
                None => (parser.finish(), true),
            };

            for event in events {
                match event {
                    ParserEvent::ContentDelta(text) => {
                        self.transition(conversation, message, MessageEvent::ContentDelta(text));
                    }
                    ParserEvent::StreamComplete => {
                        self.transition(conversation, message, MessageEvent::StreamComplete);
                        return Ok(());
                    }
                    ParserEvent::StreamError(upstream) => {
                        return Err(GatewayError::StreamError {
                            provider: provider.id.clone(),
                            message: upstream,
                        });
                    }
                }
            }

            if eof {
                // Families without a sentinel end at end of body
                if message.content().is_empty() {
                    return Err(GatewayError::MalformedResponse {
                        provider: provider.id.clone(),
                        message: "stream ended without content".to_string(),
                    });
                }
                tracing::debug!(provider = %provider.id, "Stream ended without sentinel");
                self.transition(conversation, message, MessageEvent::StreamComplete);
                return Ok(());
            }

            if !persist_every.is_zero()
                && message.status() == MessageStatus::Streaming
                && last_persist.elapsed() >= persist_every
            {
                if let Err(e) = self.history.update_message(conversation, message).await {
                    tracing::warn!(conversation = %conversation, error = %e, "Failed to persist partial message");
                }
                last_persist = Instant::now();
            }
        }
    }

    async fn consume_completion(
        &self,
        conversation: &ConversationId,
        provider: &Provider,
        request: &ProviderRequest,
        response: TransportResponse,
        message: &mut Message,
    ) -> Result<(), GatewayError> {
        let body = response
            .collect_body(COMPLETION_BODY_LIMIT)
            .await
            .map_err(|e| GatewayError::from_transport(&request.provider, e))?;

        let malformed = |detail: String| GatewayError::MalformedResponse {
            provider: provider.id.clone(),
            message: detail,
        };

        let value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| malformed(e.to_string()))?;
        let text = provider
            .kind
            .schema()
            .extract_completion(&value)
            .ok_or_else(|| malformed("response has no completion text".to_string()))?;

        self.transition(conversation, message, MessageEvent::FullResponse(text));
        Ok(())
    }

    /// Apply an event and notify subscribers when it took effect
    fn transition(&self, conversation: &ConversationId, message: &mut Message, event: MessageEvent) {
        if message.apply(event).is_some() {
            self.emit(conversation, message);
        }
    }

    fn emit(&self, conversation: &ConversationId, message: &Message) {
        // No subscribers is fine
        let _ = self.events.send(GatewayEvent::MessageStateChanged {
            conversation_id: conversation.clone(),
            message: message.clone(),
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.registry.len())
            .field("request_timeout", &self.config.request_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::error::ErrorKind;
    use crate::transport::{ByteStream, TransportError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Replies with one canned response and records requests
    struct Canned {
        status: u16,
        chunks: Vec<&'static str>,
        seen: Mutex<Vec<ProviderRequest>>,
    }

    impl Canned {
        fn new(status: u16, chunks: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                status,
                chunks,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for Canned {
        async fn execute(
            &self,
            request: &ProviderRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.seen.lock().push(request.clone());
            let body: ByteStream = futures::stream::iter(
                self.chunks
                    .iter()
                    .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                    .collect::<Vec<_>>(),
            )
            .boxed();
            Ok(TransportResponse {
                status: self.status,
                body,
            })
        }
    }

    /// Body that never yields
    struct Stalled;

    #[async_trait]
    impl HttpTransport for Stalled {
        async fn execute(&self, _: &ProviderRequest) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                body: futures::stream::pending::<Result<Bytes, TransportError>>().boxed(),
            })
        }
    }

    /// One delta every 200ms, then the sentinel after `deltas`
    struct Trickle {
        deltas: usize,
    }

    #[async_trait]
    impl HttpTransport for Trickle {
        async fn execute(&self, _: &ProviderRequest) -> Result<TransportResponse, TransportError> {
            let deltas = self.deltas;
            let body = futures::stream::unfold(0, move |sent| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let chunk = match sent.cmp(&deltas) {
                    std::cmp::Ordering::Less => "data: {\"delta\":\"x\"}\n\n",
                    std::cmp::Ordering::Equal => "data: [DONE]\n\n",
                    std::cmp::Ordering::Greater => return None,
                };
                Some((Ok(Bytes::from_static(chunk.as_bytes())), sent + 1))
            });
            Ok(TransportResponse {
                status: 200,
                body: body.boxed(),
            })
        }
    }

    fn dispatcher(transport: Arc<dyn HttpTransport>, config: GatewayConfig) -> Dispatcher {
        let (events, _) = broadcast::channel(64);
        Dispatcher::new(
            Arc::new(ProviderRegistry::with_defaults()),
            Arc::new(StaticCredentials::new().with("openai", "sk-test")),
            transport,
            Arc::new(HistoryStore::in_memory()),
            Arc::new(config),
            events,
        )
    }

    fn request(provider: &str) -> DispatchRequest {
        DispatchRequest {
            conversation_id: "c".into(),
            provider: provider.into(),
            message_id: MessageId::new(),
            prior: Arc::from(Vec::new()),
            query: "hi".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_streamed_reply() {
        let transport = Canned::new(
            200,
            vec!["data: {\"delta\":\"Hel\"}\n\n", "data: {\"delta\":\"lo\"}\n\ndata: [DONE]\n\n"],
        );
        let d = dispatcher(transport.clone(), GatewayConfig::ephemeral());
        let message = d.dispatch(request("openai")).await;

        assert_eq!(message.status(), MessageStatus::Sent);
        assert_eq!(message.content(), "Hello");
        assert_eq!(transport.seen.lock().len(), 1);

        let stored = d.history.load(&"c".into()).await.unwrap();
        assert_eq!(stored, vec![message]);
    }

    #[tokio::test]
    async fn test_http_error_is_classified() {
        let transport = Canned::new(401, vec!["{\"error\":\"invalid key\"}"]);
        let d = dispatcher(transport, GatewayConfig::ephemeral());
        let message = d.dispatch(request("openai")).await;

        assert_eq!(message.status(), MessageStatus::Failed);
        let detail = message.error_detail().unwrap();
        assert_eq!(detail.kind, ErrorKind::NonSuccessStatus);
        assert_eq!(detail.status, Some(401));
        assert!(detail.message.contains("invalid key"));
    }

    #[tokio::test]
    async fn test_stream_error_keeps_partial_content() {
        let transport = Canned::new(
            200,
            vec!["data: {\"delta\":\"par\"}\n", "data: {\"error\":{\"message\":\"overloaded\"}}\n"],
        );
        let d = dispatcher(transport, GatewayConfig::ephemeral());
        let message = d.dispatch(request("openai")).await;

        assert_eq!(message.status(), MessageStatus::Failed);
        assert!(message.content().starts_with("par\n\n"));
        assert_eq!(message.error_detail().unwrap().kind, ErrorKind::StreamError);
    }

    #[tokio::test]
    async fn test_eof_without_sentinel() {
        let d = dispatcher(
            Canned::new(200, vec!["data: {\"delta\":\"done anyway\"}\n"]),
            GatewayConfig::ephemeral(),
        );
        let message = d.dispatch(request("openai")).await;
        assert_eq!(message.status(), MessageStatus::Sent);
        assert_eq!(message.content(), "done anyway");

        let d = dispatcher(Canned::new(200, vec![": nothing\n"]), GatewayConfig::ephemeral());
        let message = d.dispatch(request("openai")).await;
        assert_eq!(message.error_detail().unwrap().kind, ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_non_streaming_completion() {
        let mut config = GatewayConfig::ephemeral();
        config.providers.push(crate::provider::ProviderEntry {
            id: "openai".into(),
            streaming: Some(false),
            ..Default::default()
        });
        let (events, _) = broadcast::channel(8);
        let d = Dispatcher::new(
            Arc::new(config.registry().unwrap()),
            Arc::new(StaticCredentials::new().with("openai", "sk")),
            Canned::new(200, vec!["{\"choices\":[{\"message\":{\"content\":\"whole\"}}]}"]),
            Arc::new(HistoryStore::in_memory()),
            Arc::new(config),
            events,
        );
        let message = d.dispatch(request("openai")).await;
        assert_eq!(message.status(), MessageStatus::Sent);
        assert_eq!(message.content(), "whole");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let config = GatewayConfig::ephemeral().with_stream_idle_timeout(Duration::from_secs(5));
        let d = dispatcher(Arc::new(Stalled), config);
        let message = d.dispatch(request("openai")).await;
        assert_eq!(message.status(), MessageStatus::Failed);
        assert_eq!(message.error_detail().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_bounds_a_trickling_stream() {
        let config = GatewayConfig::ephemeral()
            .with_request_timeout(Duration::from_secs(2))
            .with_stream_idle_timeout(Duration::from_secs(60));
        let d = dispatcher(Arc::new(Trickle { deltas: 1_000 }), config);

        let started = Instant::now();
        let message = d.dispatch(request("openai")).await;

        assert_eq!(message.status(), MessageStatus::Failed);
        assert_eq!(message.error_detail().unwrap().kind, ErrorKind::Timeout);
        assert!(message.content().starts_with("xxxxx"));
        assert!(started.elapsed() < Duration::from_secs(3));

        let stored = d.history.load(&"c".into()).await.unwrap();
        assert_eq!(stored, vec![message]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_reply_is_saved_while_streaming() {
        let config = GatewayConfig::ephemeral()
            .with_request_timeout(Duration::from_secs(30))
            .with_stream_persist_interval(Duration::from_millis(500));
        let d = dispatcher(Arc::new(Trickle { deltas: 10 }), config);

        let running = tokio::spawn({
            let d = d.clone();
            async move { d.dispatch(request("openai")).await }
        });

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let stored = d.history.load(&"c".into()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status(), MessageStatus::Streaming);
        assert!(!stored[0].content().is_empty());
        assert!(stored[0].content().len() < 10);

        let message = running.await.unwrap();
        assert_eq!(message.status(), MessageStatus::Sent);
        assert_eq!(message.content(), "x".repeat(10));
        let stored = d.history.load(&"c".into()).await.unwrap();
        assert_eq!(stored, vec![message]);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let d = dispatcher(Canned::new(200, vec![]), GatewayConfig::ephemeral());
        let req = request("openai");
        req.cancel.cancel();
        let message = d.dispatch(req).await;
        assert_eq!(message.status(), MessageStatus::Failed);
        assert!(message.content().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_system_prompt_and_context() {
        let transport = Canned::new(200, vec!["data: [DONE]\n"]);
        let config = GatewayConfig::ephemeral().with_system_prompt("Be brief.");
        let d = dispatcher(transport.clone(), config);

        let mut req = request("openai");
        req.prior = Arc::from(vec![Message::user("earlier question")]);
        let message = d.dispatch(req).await;
        assert_eq!(message.status(), MessageStatus::Sent);

        let seen = transport.seen.lock();
        let body = &seen[0].body;
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "earlier question");
        assert_eq!(messages.last().unwrap()["content"], "hi");
    }
}
