//! Fan-out/Fan-in Coordinator
//!
//! Sends one query to N providers at once and gathers the replies.
//!
//! ```text
//!                         ┌─▶ dispatch(openai) ────┐
//!   dispatch_to_all ──────┼─▶ dispatch(anthropic) ─┼──▶ Tagged, Tagged, Tagged, AllComplete
//!                         └─▶ dispatch(gemini) ────┘      (completion order)     (always last)
//! ```
//!
//! One task per provider in a `JoinSet`; a task's tagged result is sent the
//! moment it finishes, so a fast provider is never held back by a slow one.
//! Failures stay independent: one provider failing (or its task panicking)
//! only produces a failed message tagged with that provider.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::error::GatewayError;
use crate::events::{FanOutSummary, TaggedMessage};
use crate::ids::{ConversationId, MessageId, ProviderId};
use crate::message::Message;

/// Input to [`FanOutCoordinator::dispatch_to_all`]
#[derive(Clone, Debug)]
pub struct FanOutRequest {
    /// Conversation the replies belong to
    pub conversation_id: ConversationId,
    /// Target providers (duplicates are collapsed)
    pub providers: Vec<ProviderId>,
    /// The new user message
    pub query: String,
    /// History before the new user message
    pub prior: Arc<[Message]>,
    /// Conversation-level cancellation
    pub cancel: CancellationToken,
}

/// Output of a fan-out, in completion order
#[derive(Clone, Debug, PartialEq)]
pub enum FanOutEvent {
    /// One provider's terminal message
    Tagged(TaggedMessage),
    /// Every dispatch finished; always the last event
    AllComplete(FanOutSummary),
}

/// Runs dispatches concurrently and aggregates them
#[derive(Clone, Debug)]
pub struct FanOutCoordinator {
    dispatcher: Dispatcher,
}

impl FanOutCoordinator {
    /// Coordinator over a dispatcher
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Dispatch `request.query` to every provider
    ///
    /// Returns immediately; the receiver yields one `Tagged` event per
    /// distinct provider followed by `AllComplete`.
    pub fn dispatch_to_all(&self, request: FanOutRequest) -> mpsc::Receiver<FanOutEvent> {
        let providers = distinct(&request.providers);
        let (tx, rx) = mpsc::channel(providers.len() + 1);
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            let summary = run_all(dispatcher, request, providers, &tx).await;
            // Receiver gone means nobody is listening any more
            let _ = tx.send(FanOutEvent::AllComplete(summary)).await;
        });

        rx
    }
}

/// Providers in first-seen order without duplicates
fn distinct(providers: &[ProviderId]) -> Vec<ProviderId> {
    let mut seen = HashSet::new();
    providers
        .iter()
        .filter(|p| seen.insert((*p).clone()))
        .cloned()
        .collect()
}

async fn run_all(
    dispatcher: Dispatcher,
    request: FanOutRequest,
    providers: Vec<ProviderId>,
    tx: &mpsc::Sender<FanOutEvent>,
) -> FanOutSummary {
    let conversation = request.conversation_id.clone();
    let mut tasks = JoinSet::new();
    let mut owners = HashMap::new();

    for provider in providers {
        let dispatcher = dispatcher.clone();
        let message_id = MessageId::new();
        let dispatch = DispatchRequest {
            conversation_id: request.conversation_id.clone(),
            provider: provider.clone(),
            message_id: message_id.clone(),
            prior: Arc::clone(&request.prior),
            query: request.query.clone(),
            cancel: request.cancel.clone(),
        };
        let handle = tasks.spawn(async move { dispatcher.dispatch(dispatch).await });
        owners.insert(handle.id(), (provider, message_id));
    }

    let mut summary = FanOutSummary {
        dispatched: owners.len(),
        ..FanOutSummary::default()
    };
    tracing::debug!(conversation = %conversation, providers = summary.dispatched, "Fan-out started");

    while let Some(joined) = tasks.join_next_with_id().await {
        let (provider, message) = match joined {
            Ok((id, message)) => {
                let provider = owners
                    .remove(&id)
                    .map(|(provider, _)| provider)
                    .or_else(|| message.provider_source().cloned())
                    .unwrap_or_else(|| ProviderId::new("unknown"));
                (provider, message)
            }
            Err(e) => {
                let Some((provider, message_id)) = owners.remove(&e.id()) else {
                    tracing::error!(error = %e, "Dispatch task ended with an unknown id");
                    continue;
                };
                tracing::error!(provider = %provider, error = %e, "Dispatch task died");
                let error = GatewayError::StreamError {
                    provider: provider.clone(),
                    message: "dispatch aborted unexpectedly".to_string(),
                };
                (
                    provider,
                    dispatcher
                        .fail_detached(&conversation, &message_id, error)
                        .await,
                )
            }
        };

        summary.record(&message);
        if tx
            .send(FanOutEvent::Tagged(TaggedMessage { provider, message }))
            .await
            .is_err()
        {
            tracing::debug!(conversation = %conversation, "Fan-out receiver dropped");
        }
    }

    tracing::info!(
        conversation = %conversation,
        dispatched = summary.dispatched,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Fan-out complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::credentials::StaticCredentials;
    use crate::history::HistoryStore;
    use crate::message::MessageStatus;
    use crate::provider::ProviderRegistry;
    use crate::request::ProviderRequest;
    use crate::transport::{HttpTransport, TransportError, TransportResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio::sync::broadcast;

    /// Echoes the provider id back as the reply; panics for "boom"
    struct Echo;

    #[async_trait]
    impl HttpTransport for Echo {
        async fn execute(
            &self,
            request: &ProviderRequest,
        ) -> Result<TransportResponse, TransportError> {
            assert!(request.provider.as_str() != "boom", "transport exploded");
            let line = format!("data: {{\"delta\":\"{}\"}}\n\ndata: [DONE]\n\n", request.provider);
            Ok(TransportResponse {
                status: 200,
                body: futures::stream::iter(vec![Ok(Bytes::from(line))]).boxed(),
            })
        }
    }

    fn coordinator() -> FanOutCoordinator {
        coordinator_with_history().0
    }

    fn coordinator_with_history() -> (FanOutCoordinator, Arc<HistoryStore>) {
        let registry = ProviderRegistry::with_defaults();
        let mut builder = ProviderRegistry::builder();
        for provider in registry.providers() {
            builder.upsert((*provider).clone());
        }
        builder.upsert(crate::provider::Provider::new(
            "boom",
            crate::provider::ProviderKind::OpenAiCompatible,
            "http://boom",
            "m",
        ));

        let history = Arc::new(HistoryStore::in_memory());
        let (events, _) = broadcast::channel(64);
        let coordinator = FanOutCoordinator::new(Dispatcher::new(
            Arc::new(builder.build()),
            Arc::new(StaticCredentials::new()),
            Arc::new(Echo),
            Arc::clone(&history),
            Arc::new(GatewayConfig::ephemeral()),
            events,
        ));
        (coordinator, history)
    }

    fn fan_request(providers: &[&str]) -> FanOutRequest {
        FanOutRequest {
            conversation_id: "fan".into(),
            providers: providers.iter().map(|p| ProviderId::new(*p)).collect(),
            query: "q".into(),
            prior: Arc::from(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<FanOutEvent>) -> Vec<FanOutEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_empty_set_completes_immediately() {
        let events = collect(coordinator().dispatch_to_all(fan_request(&[]))).await;
        assert_eq!(events, vec![FanOutEvent::AllComplete(FanOutSummary::default())]);
    }

    #[tokio::test]
    async fn test_dispatch_to_all_does_not_block_caller() {
        let mut rx = coordinator().dispatch_to_all(fan_request(&["ollama"]));
        {
            let mut first = tokio_test::task::spawn(rx.recv());
            tokio_test::assert_pending!(first.poll());
        }
        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicates_collapse() {
        let events =
            collect(coordinator().dispatch_to_all(fan_request(&["ollama", "ollama"]))).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            FanOutEvent::Tagged(tagged) => {
                assert_eq!(tagged.provider.as_str(), "ollama");
                assert_eq!(tagged.message.content(), "ollama");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_dispatch_is_tagged_failed() {
        let (coordinator, history) = coordinator_with_history();
        let events = collect(coordinator.dispatch_to_all(fan_request(&["ollama", "boom"]))).await;

        let tagged: HashMap<String, MessageStatus> = events
            .iter()
            .filter_map(|e| match e {
                FanOutEvent::Tagged(t) => Some((t.provider.to_string(), t.message.status())),
                FanOutEvent::AllComplete(_) => None,
            })
            .collect();
        assert_eq!(tagged["ollama"], MessageStatus::Sent);
        assert_eq!(tagged["boom"], MessageStatus::Failed);

        assert_eq!(
            events.last(),
            Some(&FanOutEvent::AllComplete(FanOutSummary {
                dispatched: 2,
                succeeded: 1,
                failed: 1,
            }))
        );

        // The queued record of the dead dispatch is failed in place
        let stored = history.load(&"fan".into()).await.unwrap();
        let boom: Vec<_> = stored
            .iter()
            .filter(|m| m.provider_source().map(ProviderId::as_str) == Some("boom"))
            .collect();
        assert_eq!(boom.len(), 1);
        assert_eq!(boom[0].status(), MessageStatus::Failed);
        assert!(stored.iter().all(|m| m.is_terminal()));

        let tagged_boom = events.iter().find_map(|e| match e {
            FanOutEvent::Tagged(t) if t.provider.as_str() == "boom" => Some(&t.message),
            _ => None,
        });
        assert_eq!(tagged_boom.map(|m| m.id()), Some(boom[0].id()));
    }
}
