use std::collections::HashMap;

use ember_core::{
    collab::CredentialProvider,
    engine::network::{local_server, remote_api},
};
use futures::{future::BoxFuture, FutureExt};

use crate::config::Config;

/// Tokens read from environment variables, one variable per provider.
///
/// Variables are read on every request, so a key exported after startup is
/// picked up by the next load.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentials {
    vars: HashMap<String, String>,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl Into<String>, var: impl Into<String>) -> Self {
        self.vars.insert(provider.into(), var.into());
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with(local_server::CREDENTIAL, &config.local_server.key_env)
            .with(remote_api::CREDENTIAL, &config.remote_api.key_env)
    }
}

impl CredentialProvider for EnvCredentials {
    fn token(&self, provider: &str) -> BoxFuture<'_, Option<String>> {
        let token = self
            .vars
            .get(provider)
            .and_then(|var| std::env::var(var).ok())
            .filter(|token| !token.trim().is_empty());
        futures::future::ready(token).boxed()
    }
}
