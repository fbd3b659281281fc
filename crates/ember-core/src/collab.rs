//! Collaborators the network backends consult: a credential provider and a
//! settings store.

use std::{collections::HashMap, sync::RwLock};

use futures::{future::BoxFuture, FutureExt};

/// Settings key holding the local inference server's base URL.
pub const LOCAL_SERVER_URL: &str = "local_server_url";
/// Settings key holding the remote API's base URL.
pub const REMOTE_API_URL: &str = "remote_api_url";

/// Supplies access tokens on demand.
pub trait CredentialProvider: Send + Sync {
    /// The token for `provider`, or `None` if the user has not granted one.
    fn token(&self, provider: &str) -> BoxFuture<'_, Option<String>>;
}

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// A fixed set of tokens.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(provider.into(), token.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self, provider: &str) -> BoxFuture<'_, Option<String>> {
        futures::future::ready(self.tokens.get(provider).cloned()).boxed()
    }
}

/// Settings kept in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
