use std::path::PathBuf;

use derivative::Derivative;
use ember_core::{GenerateOptions, ModelRef, DEFAULT_MAX_TOKENS};
use serde::{Deserialize, Serialize};

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG: &str = "assets/configs/Config.toml";

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Config {
    pub model: Model,
    pub accelerator: Accelerator,
    pub local_server: LocalServer,
    pub remote_api: RemoteApi,
    pub generation: Generation,
    pub log: Log,
    /// File backing the persistent settings store.
    #[derivative(Default(value = "\"assets/configs/Settings.toml\".into()"))]
    pub settings_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Model {
    /// Model loaded at startup.
    pub default: Option<ModelRef>,
    /// System prompt prepended to every conversation.
    pub system: Option<String>,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Accelerator {
    /// Directory with one sub-directory per model, each holding `model.st`
    /// and `tokenizer.json`.
    #[derivative(Default(value = "\"assets/models\".into()"))]
    pub models_dir: PathBuf,
    /// Tokens processed per inference call while prefilling.
    #[derivative(Default(value = "128"))]
    pub token_chunk_size: usize,
}

#[cfg(feature = "webgpu")]
impl From<&Accelerator> for ember_core::rwkv::RwkvOptions {
    fn from(value: &Accelerator) -> Self {
        Self {
            models_dir: value.models_dir.clone(),
            token_chunk_size: value.token_chunk_size,
        }
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct LocalServer {
    /// Seeds the `local_server_url` setting when it is unset.
    pub url: Option<String>,
    /// Environment variable holding an optional bearer token.
    #[derivative(Default(value = "\"LOCAL_SERVER_API_KEY\".into()"))]
    pub key_env: String,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct RemoteApi {
    /// Seeds the `remote_api_url` setting when it is unset.
    pub url: Option<String>,
    /// Environment variable holding the API key.
    #[derivative(Default(value = "\"ANTHROPIC_API_KEY\".into()"))]
    pub key_env: String,
}

#[derive(Debug, Clone, Copy, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Generation {
    #[derivative(Default(value = "DEFAULT_MAX_TOKENS"))]
    pub max_tokens: usize,
    #[derivative(Default(value = "true"))]
    pub enable_thinking: bool,
}

impl From<Generation> for GenerateOptions {
    fn from(value: Generation) -> Self {
        Self {
            max_tokens: value.max_tokens,
            enable_thinking: value.enable_thinking,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Log {
    pub format: LogFormat,
    /// `tracing` filter directives; `RUST_LOG` takes precedence.
    #[derivative(Default(value = "\"info\".into()"))]
    pub filter: String,
}
