//! Provider Registry
//!
//! Catalog of the LLM backends the gateway can talk to. A [`Provider`] is
//! immutable once registered and uniquely keyed by its id; the registry is
//! built once (from the default catalog and/or configuration entries) and is
//! read-only afterwards, so it is shared as a plain `Arc` without locking.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GatewayError;
use crate::ids::ProviderId;

/// What a provider can do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Plain text conversation
    Text,
    /// Code generation
    Code,
    /// Image understanding
    Image,
    /// Incremental (streamed) responses
    Streaming,
}

/// Request/response schema family spoken by a provider
///
/// This is the single discriminator the request builder and stream parser
/// switch on; see [`crate::schema`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `/chat/completions` (OpenAI, DeepSeek, Ollama, most proxies)
    OpenAiCompatible,
    /// Anthropic Messages API
    Anthropic,
    /// Google Gemini `generateContent`
    Gemini,
}

/// How the credential is attached to a request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// No authentication (local servers)
    #[default]
    None,
    /// `Authorization: Bearer <key>`
    Bearer,
    /// Raw key in a named header
    Header {
        /// Header name
        name: String,
    },
    /// Key appended as a URL query parameter
    QueryParam {
        /// Parameter name
        name: String,
    },
}

impl AuthScheme {
    /// Whether requests need a credential
    #[must_use]
    pub fn requires_credential(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A registered backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    /// Unique id
    pub id: ProviderId,
    /// Name shown to users
    pub display_name: String,
    /// API base URL, without trailing slash
    pub base_url: String,
    /// Credential placement
    pub auth_scheme: AuthScheme,
    /// Schema family
    pub kind: ProviderKind,
    /// Model requested from the backend
    pub model: String,
    /// Whether responses are requested as an event stream
    pub supports_streaming: bool,
    /// Declared capabilities
    pub capabilities: BTreeSet<Capability>,
}

impl Provider {
    /// Create a text-capable streaming provider with no authentication
    pub fn new(
        id: impl Into<ProviderId>,
        kind: ProviderKind,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.to_string(),
            id,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_scheme: AuthScheme::None,
            kind,
            model: model.into(),
            supports_streaming: true,
            capabilities: [Capability::Text, Capability::Streaming].into_iter().collect(),
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the auth scheme
    #[must_use]
    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth_scheme = auth;
        self
    }

    /// Enable or disable streaming (keeps the `Streaming` capability in sync)
    #[must_use]
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.supports_streaming = streaming;
        if streaming {
            self.capabilities.insert(Capability::Streaming);
        } else {
            self.capabilities.remove(&Capability::Streaming);
        }
        self
    }

    /// Add a capability
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if capability == Capability::Streaming {
            return self.with_streaming(true);
        }
        self.capabilities.insert(capability);
        self
    }

    /// Check a capability
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Registry construction errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two providers registered under one id
    #[error("provider {0} is already registered")]
    DuplicateProvider(ProviderId),

    /// Config entry missing a field with no default to fall back on
    #[error("provider entry {id} is missing `{field}`")]
    IncompleteEntry {
        /// Entry id
        id: ProviderId,
        /// Missing field
        field: &'static str,
    },
}

/// Provider declared in configuration
///
/// Fields left out fall back to the built-in provider with the same id, so
/// `[[providers]] id = "openai" model = "gpt-4o"` only swaps the model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Provider id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Schema family
    #[serde(default)]
    pub kind: Option<ProviderKind>,
    /// API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model name
    #[serde(default)]
    pub model: Option<String>,
    /// Credential placement
    #[serde(default)]
    pub auth: Option<AuthScheme>,
    /// Streaming toggle
    #[serde(default)]
    pub streaming: Option<bool>,
    /// Extra capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Environment variable holding the API key (default `<ID>_API_KEY`)
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderEntry {
    /// Resolve against an optional built-in default
    pub fn resolve(&self, default: Option<&Provider>) -> Result<Provider, RegistryError> {
        let id = ProviderId::new(self.id.clone());
        let missing = |field| RegistryError::IncompleteEntry {
            id: id.clone(),
            field,
        };

        let kind = self
            .kind
            .or(default.map(|p| p.kind))
            .ok_or_else(|| missing("kind"))?;
        let base_url = self
            .base_url
            .clone()
            .or_else(|| default.map(|p| p.base_url.clone()))
            .ok_or_else(|| missing("base_url"))?;
        let model = self
            .model
            .clone()
            .or_else(|| default.map(|p| p.model.clone()))
            .ok_or_else(|| missing("model"))?;

        let mut provider = Provider::new(id.clone(), kind, base_url, model);
        if let Some(default) = default {
            provider.display_name = default.display_name.clone();
            provider.auth_scheme = default.auth_scheme.clone();
            provider.capabilities = default.capabilities.clone();
            provider.supports_streaming = default.supports_streaming;
        }
        if let Some(ref name) = self.display_name {
            provider.display_name = name.clone();
        }
        if let Some(ref auth) = self.auth {
            provider.auth_scheme = auth.clone();
        } else if self.api_key_env.is_some() && provider.auth_scheme == AuthScheme::None {
            // A named key variable means the key is meant to be sent
            provider.auth_scheme = AuthScheme::Bearer;
        }
        for capability in &self.capabilities {
            provider = provider.with_capability(*capability);
        }
        if let Some(streaming) = self.streaming {
            provider = provider.with_streaming(streaming);
        }
        Ok(provider)
    }
}

/// Read-only provider catalog
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, Arc<Provider>>,
}

impl ProviderRegistry {
    /// Start an empty registry
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Registry holding the built-in catalog
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut builder = Self::builder();
        for provider in default_providers() {
            builder.upsert(provider);
        }
        builder.build()
    }

    /// Built-in catalog overlaid with configuration entries
    pub fn from_entries(entries: &[ProviderEntry]) -> Result<Self, RegistryError> {
        let defaults: HashMap<ProviderId, Provider> = default_providers()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut builder = Self::builder();
        for provider in defaults.values() {
            builder.upsert(provider.clone());
        }

        let mut seen = BTreeSet::new();
        for entry in entries {
            let id = ProviderId::new(entry.id.clone());
            if !seen.insert(id.clone()) {
                return Err(RegistryError::DuplicateProvider(id));
            }
            let provider = entry.resolve(defaults.get(&id))?;
            tracing::debug!(provider = %provider.id, model = %provider.model, "Configured provider");
            builder.upsert(provider);
        }

        Ok(builder.build())
    }

    /// Find a provider
    pub fn lookup(&self, id: &ProviderId) -> Result<Arc<Provider>, GatewayError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::UnsupportedProvider {
                provider: id.clone(),
            })
    }

    /// Declared capabilities of a provider
    pub fn capabilities(&self, id: &ProviderId) -> Result<&BTreeSet<Capability>, GatewayError> {
        self.providers
            .get(id)
            .map(|p| &p.capabilities)
            .ok_or_else(|| GatewayError::UnsupportedProvider {
                provider: id.clone(),
            })
    }

    /// Whether `id` is registered and declares `capability`
    #[must_use]
    pub fn supports(&self, id: &ProviderId, capability: Capability) -> bool {
        self.providers.get(id).is_some_and(|p| p.has(capability))
    }

    /// Whether `id` is registered
    #[must_use]
    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    /// All providers, sorted by id
    #[must_use]
    pub fn providers(&self) -> Vec<Arc<Provider>> {
        let mut all: Vec<_> = self.providers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Builder for [`ProviderRegistry`]
#[derive(Debug, Default)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<ProviderId, Arc<Provider>>,
}

impl ProviderRegistryBuilder {
    /// Register a provider; ids must be unique
    pub fn register(mut self, provider: Provider) -> Result<Self, RegistryError> {
        if self.providers.contains_key(&provider.id) {
            return Err(RegistryError::DuplicateProvider(provider.id));
        }
        self.providers.insert(provider.id.clone(), Arc::new(provider));
        Ok(self)
    }

    /// Insert or replace a provider
    pub fn upsert(&mut self, provider: Provider) {
        self.providers.insert(provider.id.clone(), Arc::new(provider));
    }

    /// Freeze the registry
    #[must_use]
    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
        }
    }
}

/// The built-in provider catalog
#[must_use]
pub fn default_providers() -> Vec<Provider> {
    vec![
        Provider::new(
            "openai",
            ProviderKind::OpenAiCompatible,
            "https://api.openai.com/v1",
            "gpt-4o-mini",
        )
        .with_display_name("OpenAI")
        .with_auth(AuthScheme::Bearer)
        .with_capability(Capability::Code)
        .with_capability(Capability::Image),
        Provider::new(
            "anthropic",
            ProviderKind::Anthropic,
            "https://api.anthropic.com/v1",
            "claude-3-5-haiku-latest",
        )
        .with_display_name("Anthropic Claude")
        .with_auth(AuthScheme::Header {
            name: "x-api-key".to_string(),
        })
        .with_capability(Capability::Code)
        .with_capability(Capability::Image),
        Provider::new(
            "gemini",
            ProviderKind::Gemini,
            "https://generativelanguage.googleapis.com/v1beta",
            "gemini-1.5-flash",
        )
        .with_display_name("Google Gemini")
        .with_auth(AuthScheme::QueryParam {
            name: "key".to_string(),
        })
        .with_capability(Capability::Code)
        .with_capability(Capability::Image),
        Provider::new(
            "deepseek",
            ProviderKind::OpenAiCompatible,
            "https://api.deepseek.com/v1",
            "deepseek-chat",
        )
        .with_display_name("DeepSeek")
        .with_auth(AuthScheme::Bearer)
        .with_capability(Capability::Code),
        Provider::new(
            "ollama",
            ProviderKind::OpenAiCompatible,
            "http://localhost:11434/v1",
            "llama3.2",
        )
        .with_display_name("Ollama (local)"),
    ]
}
