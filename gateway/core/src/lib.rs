//! Gateway Core - Multi-provider Conversational AI Gateway
//!
//! One conversation surface, many LLM backends. This crate resolves provider
//! ids to endpoints, builds provider-specific requests, parses streamed
//! replies token by token, fans one query out to several providers at once
//! and keeps per-conversation history with a well-defined message lifecycle.
//! It has no UI dependencies: the CLI in `gateway-cli` is one consumer, any
//! other front end subscribes to the same events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Front ends (CLI, ...)                        │
//! │        send_message(conv, target, text)      subscribe() ▲           │
//! └──────────────────────────────┬───────────────────────────┼───────────┘
//!                                │                           │ GatewayEvent
//! ┌──────────────────────────────┼───────────────────────────┼───────────┐
//! │                       GATEWAY CORE                       │           │
//! │  ┌───────────────────────────┴─────────────────────────┐ │           │
//! │  │                  GatewayService                     │─┘           │
//! │  └───────────────────────────┬─────────────────────────┘             │
//! │                              ▼                                       │
//! │  ┌─────────────────────────────────────────────────────┐             │
//! │  │   FanOutCoordinator  (one task per provider)        │             │
//! │  └───────────────────────────┬─────────────────────────┘             │
//! │                              ▼                                       │
//! │  ┌──────────┐  ┌──────────────┐  ┌───────────┐  ┌────────────────┐   │
//! │  │ Provider │─▶│   Request    │─▶│   Http    │─▶│ StreamParser   │   │
//! │  │ Registry │  │   Builder    │  │ Transport │  │                │   │
//! │  └──────────┘  └──────────────┘  └───────────┘  └───────┬────────┘   │
//! │                                                         ▼            │
//! │                 ┌────────────────┐   ┌───────────────────────────┐   │
//! │                 │  HistoryStore  │◀──│  Message state machine    │   │
//! │                 └────────────────┘   └───────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`GatewayService`]: dependency-injected entry point
//! - [`ProviderRegistry`]: read-only catalog of backends
//! - [`Message`]: conversation message and its lifecycle
//! - [`StreamParser`]: incremental `data:` stream parser
//! - [`HistoryStore`]: canonical per-conversation message sequence
//! - [`GatewayError`]: closed failure taxonomy
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{load_config, ConversationId, GatewayEvent, GatewayService, ProviderId};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = GatewayService::from_config(load_config()?)?;
//!     let mut events = service.subscribe();
//!
//!     let conversation = ConversationId::new("demo");
//!     let targets = vec![ProviderId::new("openai"), ProviderId::new("anthropic")];
//!     let done = service.send_message(conversation, targets, "Hello!");
//!
//!     while let Ok(event) = events.recv().await {
//!         if let GatewayEvent::AllComplete { summary, .. } = event {
//!             println!("{} of {} succeeded", summary.succeeded, summary.dispatched);
//!             break;
//!         }
//!     }
//!     done.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`provider`]: provider catalog and configuration entries
//! - [`credentials`]: credential supplier boundary
//! - [`schema`]: per-family wire schemas
//! - [`request`]: request building and conversation context
//! - [`transport`]: HTTP boundary
//! - [`streaming`]: event stream parser
//! - [`message`]: message state machine
//! - [`history`]: conversation persistence
//! - [`dispatch`]: single-provider pipeline
//! - [`fanout`]: concurrent multi-provider dispatch
//! - [`events`]: subscriber notifications
//! - [`gateway`]: service root
//! - [`config`]: TOML and environment configuration
//! - [`error`]: error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fanout;
pub mod gateway;
pub mod history;
pub mod ids;
pub mod message;
pub mod provider;
pub mod request;
pub mod schema;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use config::{
    default_config_path, default_history_dir, load_config, load_config_from_path, ConfigError,
    ConfigOverrides, ConfigSource, ConfigToml, GatewayConfig,
};
pub use credentials::{CredentialSupplier, EnvCredentials, StaticCredentials};
pub use dispatch::{DispatchRequest, Dispatcher};
pub use error::{ErrorDetail, ErrorKind, GatewayError};
pub use events::{FanOutSummary, GatewayEvent, TaggedMessage};
pub use fanout::{FanOutCoordinator, FanOutEvent, FanOutRequest};
pub use gateway::{DispatchTarget, GatewayService};
pub use history::{
    Conversation, ConversationStorage, FileStorage, HistoryError, HistoryStore, MemoryStorage,
};
pub use ids::{ConversationId, MessageId, ProviderId};
pub use message::{Message, MessageEvent, MessageRole, MessageStatus, Transition};
pub use provider::{
    AuthScheme, Capability, Provider, ProviderEntry, ProviderKind, ProviderRegistry,
    RegistryError,
};
pub use request::{ConversationContext, GenerationParams, ProviderRequest, RequestBuilder};
pub use streaming::{ParseError, ParserEvent, StreamParser};
pub use transport::{
    ByteStream, HttpTransport, ReqwestTransport, TransportError, TransportResponse,
};
