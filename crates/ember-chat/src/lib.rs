//! ember-chat library crate.
//!
//! Everything the `ember` binary wires together, exported for testing.

use std::{path::Path, sync::Arc};

use anyhow::{bail, Result};
use ember_core::{
    collab::{self, CredentialProvider, SettingsStore},
    BackendKind, BackendRouter, CapabilityInfo, EngineEvent, EngineFactory,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

pub mod chat;
pub mod config;
pub mod credentials;
pub mod logging;
pub mod settings;

/// Load a configuration file from the given path.
pub async fn load_config(path: impl AsRef<Path>) -> Result<config::Config> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(toml::from_str(&contents)?)
}

/// Load `path`, falling back to defaults when the file does not exist.
///
/// Returns whether the file was found.
pub async fn load_or_default(path: impl AsRef<Path>) -> Result<(config::Config, bool)> {
    match tokio::fs::try_exists(path.as_ref()).await? {
        true => Ok((load_config(path).await?, true)),
        false => Ok((config::Config::default(), false)),
    }
}

/// Copy the server URLs from the config into settings that are still unset.
pub fn seed_settings(config: &config::Config, settings: &dyn SettingsStore) -> Result<()> {
    settings::seed(
        settings,
        &[
            (collab::LOCAL_SERVER_URL, config.local_server.url.as_deref()),
            (collab::REMOTE_API_URL, config.remote_api.url.as_deref()),
        ],
    )
}

/// Build the router over every backend this build supports.
#[cfg_attr(not(feature = "webgpu"), allow(unused_variables))]
pub fn build_router(
    config: &config::Config,
    credentials: Arc<dyn CredentialProvider>,
    settings: Arc<dyn SettingsStore>,
) -> BackendRouter {
    let factory = EngineFactory::new(credentials, settings);
    #[cfg(feature = "webgpu")]
    let factory = factory.with_accelerator(Arc::new(ember_core::rwkv::WebGpuRuntime::new(
        (&config.accelerator).into(),
    )));
    BackendRouter::new(factory)
}

/// Activate the `kind` backend and wait for its answer to a check.
pub async fn probe(router: &BackendRouter, kind: BackendKind) -> Result<CapabilityInfo> {
    router.activate(kind).await?;

    let (sender, receiver) = flume::bounded(1);
    let id = router.on_message(Arc::new(move |event: &EngineEvent| {
        if let EngineEvent::CapabilityInfo { .. } | EngineEvent::Error { .. } = event {
            let _ = sender.try_send(event.clone());
        }
    }));
    let answer = match router.check() {
        Ok(()) => receiver.recv_async().await.ok(),
        Err(err) => {
            router.off_message(id);
            return Err(err.into());
        }
    };
    router.off_message(id);

    match answer {
        Some(EngineEvent::CapabilityInfo { data }) => Ok(data),
        Some(EngineEvent::Error { message }) => {
            logging::errors::capability_check_failed(kind.as_str(), &message);
            bail!(message)
        }
        _ => bail!("{kind} backend closed before answering the check"),
    }
}
