//! Gateway Service
//!
//! The dependency-injected root of the gateway. Callers hand it
//! `(conversation, target, text)` and watch the results arrive on a
//! subscription; they never touch the dispatcher, parser or storage
//! directly.
//!
//! ```text
//!   send_message(conv, [openai, anthropic], "hi")
//!       │
//!       ├─ append user message ────────────────▶ MessageStateChanged(user)
//!       ├─ FanOutCoordinator::dispatch_to_all
//!       │     ├─ openai:    queued → sending → streaming… → sent   ─▶ MessageStateChanged(…), Tagged(openai)
//!       │     └─ anthropic: queued → sending → failed               ─▶ MessageStateChanged(…), Tagged(anthropic)
//!       └─ AllComplete {dispatched: 2, succeeded: 1, failed: 1}     ─▶ AllComplete
//! ```
//!
//! Cancellation is per conversation: [`GatewayService::cancel_conversation`]
//! fails every in-flight dispatch of that conversation, and the next
//! `send_message` starts with a fresh token.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, GatewayConfig};
use crate::credentials::CredentialSupplier;
use crate::dispatch::Dispatcher;
use crate::events::{FanOutSummary, GatewayEvent, TaggedMessage};
use crate::fanout::{FanOutCoordinator, FanOutEvent, FanOutRequest};
use crate::history::{HistoryError, HistoryStore};
use crate::ids::{ConversationId, ProviderId};
use crate::message::Message;
use crate::provider::ProviderRegistry;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Which providers a message goes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchTarget {
    /// One provider
    Single(ProviderId),
    /// Several providers at once
    Many(Vec<ProviderId>),
}

impl DispatchTarget {
    /// Target providers, as given
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderId> {
        match self {
            Self::Single(id) => vec![id.clone()],
            Self::Many(ids) => ids.clone(),
        }
    }
}

impl From<ProviderId> for DispatchTarget {
    fn from(id: ProviderId) -> Self {
        Self::Single(id)
    }
}

impl From<&str> for DispatchTarget {
    fn from(id: &str) -> Self {
        Self::Single(ProviderId::new(id))
    }
}

impl From<Vec<ProviderId>> for DispatchTarget {
    fn from(ids: Vec<ProviderId>) -> Self {
        Self::Many(ids)
    }
}

/// Conversational gateway; cheap to clone
#[derive(Clone)]
pub struct GatewayService {
    registry: Arc<ProviderRegistry>,
    history: Arc<HistoryStore>,
    coordinator: FanOutCoordinator,
    events: broadcast::Sender<GatewayEvent>,
    cancels: Arc<DashMap<ConversationId, ActiveSends>>,
    config: Arc<GatewayConfig>,
}

/// Cancellation shared by the in-flight sends of one conversation
#[derive(Debug)]
struct ActiveSends {
    token: CancellationToken,
    sends: usize,
}

impl GatewayService {
    /// Wire the service from its collaborators
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        history: HistoryStore,
        credentials: Arc<dyn CredentialSupplier>,
        transport: Arc<dyn HttpTransport>,
        config: GatewayConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let history = Arc::new(history);
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            credentials,
            transport,
            Arc::clone(&history),
            Arc::clone(&config),
            events.clone(),
        );

        tracing::debug!(providers = registry.len(), "Gateway service created");

        Self {
            registry,
            history,
            coordinator: FanOutCoordinator::new(dispatcher),
            events,
            cancels: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Production wiring: configured registry, history location,
    /// environment credentials and a `reqwest` transport
    pub fn from_config(config: GatewayConfig) -> Result<Self, ConfigError> {
        let registry = config.registry()?;
        let history = config.history_store();
        let credentials = Arc::new(config.env_credentials());
        let transport = Arc::new(ReqwestTransport::new(config.connect_timeout)?);
        Ok(Self::new(registry, history, credentials, transport, config))
    }

    /// Receive every event from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Provider catalog
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Conversation history
    #[must_use]
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Fan-out coordinator, for callers that want the tagged stream directly
    #[must_use]
    pub fn coordinator(&self) -> &FanOutCoordinator {
        &self.coordinator
    }

    /// Send a user message and dispatch it
    ///
    /// Work runs on a spawned task; progress arrives through
    /// [`subscribe`](Self::subscribe). The handle resolves to the fan-out
    /// summary once every dispatch is terminal. Only a failure to record the
    /// user message is an error; provider failures are failed messages.
    pub fn send_message(
        &self,
        conversation_id: ConversationId,
        target: impl Into<DispatchTarget>,
        text: impl Into<String>,
    ) -> JoinHandle<Result<FanOutSummary, HistoryError>> {
        let target = target.into();
        let text = text.into();
        let cancel = self.cancel_token(&conversation_id);
        let service = self.clone();

        tokio::spawn(async move {
            let result = service
                .run_send(&conversation_id, target, text, cancel.clone())
                .await;
            service.release_token(&conversation_id, &cancel);
            result
        })
    }

    /// Abort every in-flight dispatch of a conversation
    ///
    /// Returns whether anything was registered for it.
    pub fn cancel_conversation(&self, conversation_id: &ConversationId) -> bool {
        match self.cancels.remove(conversation_id) {
            Some((_, active)) => {
                tracing::info!(
                    conversation = %conversation_id,
                    sends = active.sends,
                    "Cancelling conversation"
                );
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Token for a new send; registers the send until [`Self::release_token`]
    fn cancel_token(&self, conversation_id: &ConversationId) -> CancellationToken {
        let mut entry = self
            .cancels
            .entry(conversation_id.clone())
            .or_insert_with(|| ActiveSends {
                token: CancellationToken::new(),
                sends: 0,
            });
        if entry.token.is_cancelled() {
            entry.token = CancellationToken::new();
            entry.sends = 0;
        }
        entry.sends += 1;
        entry.token.clone()
    }

    /// A send finished; forget the conversation once no send is left
    fn release_token(&self, conversation_id: &ConversationId, token: &CancellationToken) {
        // A cancelled token was already removed by `cancel_conversation`
        if token.is_cancelled() {
            return;
        }
        if let Entry::Occupied(mut entry) = self.cancels.entry(conversation_id.clone()) {
            let active = entry.get_mut();
            active.sends = active.sends.saturating_sub(1);
            if active.sends == 0 {
                entry.remove();
            }
        }
    }

    async fn run_send(
        &self,
        conversation_id: &ConversationId,
        target: DispatchTarget,
        text: String,
        cancel: CancellationToken,
    ) -> Result<FanOutSummary, HistoryError> {
        let providers = target.providers();
        let starting_provider = match &target {
            DispatchTarget::Single(id) => Some(id.clone()),
            DispatchTarget::Many(_) => None,
        };
        self.history
            .ensure_conversation(conversation_id, starting_provider)
            .await?;

        let prior: Arc<[Message]> = self.history.load(conversation_id).await?.into();

        let user = Message::user(text.clone());
        self.history.append(conversation_id, user.clone()).await?;
        let _ = self.events.send(GatewayEvent::MessageStateChanged {
            conversation_id: conversation_id.clone(),
            message: user,
        });

        tracing::info!(
            conversation = %conversation_id,
            providers = providers.len(),
            "Dispatching message"
        );

        let mut rx = self.coordinator.dispatch_to_all(FanOutRequest {
            conversation_id: conversation_id.clone(),
            providers,
            query: text,
            prior,
            cancel,
        });

        let mut summary = FanOutSummary::default();
        while let Some(event) = rx.recv().await {
            match event {
                FanOutEvent::Tagged(TaggedMessage { provider, message }) => {
                    tracing::debug!(
                        conversation = %conversation_id,
                        provider = %provider,
                        status = ?message.status(),
                        "Provider finished"
                    );
                    let _ = self.events.send(GatewayEvent::Tagged {
                        conversation_id: conversation_id.clone(),
                        provider,
                        message,
                    });
                }
                FanOutEvent::AllComplete(done) => {
                    summary = done;
                    let _ = self.events.send(GatewayEvent::AllComplete {
                        conversation_id: conversation_id.clone(),
                        summary,
                    });
                }
            }
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("providers", &self.registry.len())
            .field("active_conversations", &self.cancels.len())
            .finish_non_exhaustive()
    }
}
