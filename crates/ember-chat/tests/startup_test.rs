use std::sync::Arc;

use ember_chat::{build_router, config::LogFormat, load_config, load_or_default, probe, seed_settings};
use ember_chat::{credentials::EnvCredentials, settings::FileSettings};
use ember_core::{
    collab::{self, MemorySettings, SettingsStore},
    BackendKind, ModelRef,
};

const CONFIG: &str = r#"
settings_path = "Settings.toml"

[model]
default = { kind = "remote-api", ref = "claude-sonnet-4-5" }
system = "Answer in one sentence."

[local_server]
url = "http://127.0.0.1:1"

[remote_api]
key_env = "EMBER_TEST_UNSET_REMOTE_KEY"

[generation]
max_tokens = 512

[log]
format = "json"
filter = "ember_core=debug"
"#;

#[tokio::test]
async fn test_load_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Config.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = load_config(&path).await.unwrap();
    assert_eq!(
        config.model.default,
        Some(ModelRef::remote_api("claude-sonnet-4-5"))
    );
    assert_eq!(config.model.system.as_deref(), Some("Answer in one sentence."));
    assert_eq!(config.generation.max_tokens, 512);
    assert!(config.generation.enable_thinking);
    assert_eq!(config.log.format, LogFormat::Json);
    assert_eq!(config.local_server.key_env, "LOCAL_SERVER_API_KEY");

    let (config, found) = load_or_default(&path).await.unwrap();
    assert!(found);
    assert_eq!(config.remote_api.key_env, "EMBER_TEST_UNSET_REMOTE_KEY");
}

#[tokio::test]
async fn test_missing_config_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let (config, found) = load_or_default(dir.path().join("absent.toml")).await.unwrap();
    assert!(!found);
    assert!(config.model.default.is_none());

    assert!(load_config(dir.path().join("absent.toml")).await.is_err());
}

#[tokio::test]
async fn test_seed_settings_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config: ember_chat::config::Config = toml::from_str(CONFIG).unwrap();
    let settings = FileSettings::open(dir.path().join(&config.settings_path)).unwrap();

    seed_settings(&config, &settings).unwrap();
    assert_eq!(
        settings.get(collab::LOCAL_SERVER_URL).as_deref(),
        Some("http://127.0.0.1:1")
    );
    assert_eq!(settings.get(collab::REMOTE_API_URL), None);

    let reopened = FileSettings::open(settings.path()).unwrap();
    assert_eq!(
        reopened.get(collab::LOCAL_SERVER_URL).as_deref(),
        Some("http://127.0.0.1:1")
    );
}

#[tokio::test]
async fn test_probe_reports_missing_credential() {
    let config: ember_chat::config::Config = toml::from_str(CONFIG).unwrap();
    let router = build_router(
        &config,
        Arc::new(EnvCredentials::from_config(&config)),
        Arc::new(MemorySettings::new()),
    );

    let err = probe(&router, BackendKind::RemoteApi).await.unwrap_err();
    assert!(err.to_string().contains("anthropic"), "{err}");
    assert_eq!(router.backend().unwrap(), BackendKind::RemoteApi);
    assert_eq!(router.listener_count(), 0);
    router.terminate().await;
}

#[tokio::test]
async fn test_probe_unreachable_local_server() {
    let config: ember_chat::config::Config = toml::from_str(CONFIG).unwrap();
    let settings = Arc::new(MemorySettings::new());
    seed_settings(&config, settings.as_ref()).unwrap();
    let router = build_router(
        &config,
        Arc::new(EnvCredentials::from_config(&config)),
        settings,
    );

    assert!(probe(&router, BackendKind::LocalServer).await.is_err());
    assert_eq!(router.listener_count(), 0);
    router.terminate().await;
}
