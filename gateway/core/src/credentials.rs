//! Credential supplier boundary
//!
//! The gateway never stores API keys. It asks a [`CredentialSupplier`] once
//! per dispatch and forgets the answer when the request is built.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::ids::ProviderId;

/// Source of provider credentials
pub trait CredentialSupplier: Send + Sync {
    /// Credential for `provider`, if one is configured
    fn get_credential(&self, provider: &ProviderId) -> Option<String>;
}

/// Credentials read from environment variables
///
/// By default the variable is `<PROVIDER>_API_KEY` with the id upper-cased
/// and dashes turned into underscores (`openai` → `OPENAI_API_KEY`).
/// Individual providers can be pointed at another variable.
#[derive(Clone, Debug, Default)]
pub struct EnvCredentials {
    overrides: HashMap<ProviderId, String>,
}

impl EnvCredentials {
    /// Create with default variable naming
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `provider`'s key from `var` instead of the default name
    #[must_use]
    pub fn with_var(mut self, provider: impl Into<ProviderId>, var: impl Into<String>) -> Self {
        self.overrides.insert(provider.into(), var.into());
        self
    }

    /// Variable consulted for `provider`
    #[must_use]
    pub fn var_name(&self, provider: &ProviderId) -> String {
        self.overrides.get(provider).cloned().unwrap_or_else(|| {
            format!(
                "{}_API_KEY",
                provider.as_str().to_uppercase().replace(['-', '.'], "_")
            )
        })
    }
}

impl CredentialSupplier for EnvCredentials {
    fn get_credential(&self, provider: &ProviderId) -> Option<String> {
        std::env::var(self.var_name(provider))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// In-memory credentials, settable at runtime
#[derive(Debug, Default)]
pub struct StaticCredentials {
    keys: DashMap<ProviderId, String>,
}

impl StaticCredentials {
    /// Empty supplier
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(self, provider: impl Into<ProviderId>, key: impl Into<String>) -> Self {
        self.set(provider, key);
        self
    }

    /// Set or replace a key
    pub fn set(&self, provider: impl Into<ProviderId>, key: impl Into<String>) {
        self.keys.insert(provider.into(), key.into());
    }

    /// Remove a key
    pub fn remove(&self, provider: &ProviderId) -> bool {
        self.keys.remove(provider).is_some()
    }
}

impl CredentialSupplier for StaticCredentials {
    fn get_credential(&self, provider: &ProviderId) -> Option<String> {
        self.keys.get(provider).map(|k| k.value().clone())
    }
}
