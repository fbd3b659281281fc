use std::{fmt, str::FromStr};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

pub mod collab;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod phase;
pub mod protocol;
pub mod resident;
pub mod router;
pub mod runtime;
#[cfg(feature = "webgpu")]
pub mod rwkv;
pub mod session;
pub mod stopping;
pub mod worker;

pub use engine::{generate_full, generate_full_with, Engine};
pub use error::EngineError;
pub use listeners::{Listener, ListenerId, Listeners};
pub use protocol::{CapabilityInfo, Command, EngineEvent, LoadingData};
pub use router::{BackendFactory, BackendRouter, EngineFactory};

/// Output token limit used when a request does not specify one.
pub const DEFAULT_MAX_TOKENS: usize = 4096;

/// Speaker of a conversation turn.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "System"),
            Role::User => write!(f, "User"),
            Role::Assistant => write!(f, "Assistant"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Derivative, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerateOptions {
    /// Output token limit.
    #[derivative(Default(value = "DEFAULT_MAX_TOKENS"))]
    pub max_tokens: usize,
    /// Whether the model may produce a reasoning trace before answering.
    #[derivative(Default(value = "true"))]
    pub enable_thinking: bool,
}

/// The outcome of one complete generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub text: String,
    pub tokens_per_second: Option<f64>,
    pub token_count: usize,
    pub input_tokens: usize,
}

/// Throughput figures reported alongside every streamed update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStats {
    pub tokens_per_second: Option<f64>,
    pub token_count: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Generating,
}

impl EngineStatus {
    /// Whether the status machine has an edge from `self` to `next`.
    ///
    /// `Ready -> Loading` is the `loadModel` edge taken when a resident
    /// model is replaced on the same backend.
    pub fn can_transition_to(self, next: EngineStatus) -> bool {
        use EngineStatus::*;
        matches!(
            (self, next),
            (Idle, Loading)
                | (Ready, Loading)
                | (Loading, Ready)
                | (Loading, Idle)
                | (Ready, Generating)
                | (Generating, Ready)
        )
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Idle => write!(f, "idle"),
            EngineStatus::Loading => write!(f, "loading"),
            EngineStatus::Ready => write!(f, "ready"),
            EngineStatus::Generating => write!(f, "generating"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model emitted its end token or the server closed the turn.
    #[default]
    Stop,
    /// The output token limit was reached.
    Length,
    /// The session was stopped through its stopping controller.
    Interrupted,
}

/// Which transport a model is served through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// On-device WebGPU worker.
    Accelerator,
    /// OpenAI-compatible inference server on this machine.
    LocalServer,
    /// Hosted API reached with a user credential.
    RemoteApi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Accelerator => "accelerator",
            BackendKind::LocalServer => "local-server",
            BackendKind::RemoteApi => "remote-api",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accelerator" | "webgpu" => Ok(BackendKind::Accelerator),
            "local-server" | "local" => Ok(BackendKind::LocalServer),
            "remote-api" | "remote" => Ok(BackendKind::RemoteApi),
            other => Err(EngineError::InvalidModelRef(other.to_string())),
        }
    }
}

/// A model identifier tagged with the backend that serves it.
///
/// The backend is decided once, when the reference is configured; routing
/// never looks inside `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub kind: BackendKind,
    #[serde(rename = "ref")]
    pub name: String,
}

impl ModelRef {
    pub fn new(kind: BackendKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn accelerator(name: impl Into<String>) -> Self {
        Self::new(BackendKind::Accelerator, name)
    }

    pub fn local_server(name: impl Into<String>) -> Self {
        Self::new(BackendKind::LocalServer, name)
    }

    pub fn remote_api(name: impl Into<String>) -> Self {
        Self::new(BackendKind::RemoteApi, name)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Parses the `kind:ref` form used on the command line and in settings.
impl FromStr for ModelRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| EngineError::InvalidModelRef(s.to_string()))?;
        let kind = kind
            .parse()
            .map_err(|_| EngineError::InvalidModelRef(s.to_string()))?;
        match name.trim() {
            "" => Err(EngineError::InvalidModelRef(s.to_string())),
            name => Ok(Self::new(kind, name)),
        }
    }
}
