//! The message envelope exchanged between a façade and its transport.
//!
//! Inbound [`Command`]s travel from the façade to the worker; outbound
//! [`EngineEvent`]s travel back and are re-broadcast to subscribers. Both
//! serialize to the tagged JSON form `{"type": "...", ...}` with camelCase
//! fields.

use serde::{Deserialize, Serialize};

use crate::{GenerateOptions, Turn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Probe whether the backend can run on this device.
    Check,
    /// Make `model_id` the resident model.
    #[serde(rename_all = "camelCase")]
    Load { model_id: String },
    /// Run one generation session over the resident model.
    Generate {
        turns: Vec<Turn>,
        #[serde(default)]
        options: GenerateOptions,
    },
    /// Raise the stop flag of the in-flight session.
    Interrupt,
    /// Clear the stop flag.
    Reset,
}

/// Progress of a model load, carried by [`EngineEvent::Loading`].
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingData {
    pub message: String,
    /// Artifact being fetched, if the update concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Fraction of `file` fetched, in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
}

impl LoadingData {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn file(file: impl Into<String>, progress: f32) -> Self {
        let file = file.into();
        Self {
            message: format!("Fetching {file}"),
            file: Some(file),
            progress: Some(progress.clamp(0.0, 1.0)),
        }
    }
}

/// What a backend reports about the hardware or service it runs on.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityInfo {
    pub vendor: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub limits: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    Loading {
        data: LoadingData,
    },
    /// The requested model is resident and warmed up.
    Ready,
    CapabilityInfo {
        data: CapabilityInfo,
    },
    #[serde(rename_all = "camelCase")]
    Start {
        input_tokens: usize,
    },
    /// Entering a phase, either `thinking` or `generating`.
    Phase {
        name: String,
    },
    /// A delta of the reasoning trace.
    Thinking {
        content: String,
    },
    /// The complete, trimmed reasoning trace.
    ThinkingDone {
        content: String,
    },
    /// A delta of the visible answer.
    #[serde(rename_all = "camelCase")]
    Update {
        output: String,
        tokens_per_second: Option<f64>,
        token_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        tokens_per_second: Option<f64>,
        token_count: usize,
        input_tokens: usize,
    },
    Error {
        message: String,
    },
}

impl EngineEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn loading(message: impl Into<String>) -> Self {
        Self::Loading {
            data: LoadingData::message(message),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Loading { .. } => "loading",
            EngineEvent::Ready => "ready",
            EngineEvent::CapabilityInfo { .. } => "capabilityInfo",
            EngineEvent::Start { .. } => "start",
            EngineEvent::Phase { .. } => "phase",
            EngineEvent::Thinking { .. } => "thinking",
            EngineEvent::ThinkingDone { .. } => "thinkingDone",
            EngineEvent::Update { .. } => "update",
            EngineEvent::Complete { .. } => "complete",
            EngineEvent::Error { .. } => "error",
        }
    }

    /// Whether the event belongs to a generation session rather than to
    /// probing or loading.
    pub fn is_session_event(&self) -> bool {
        matches!(
            self,
            EngineEvent::Start { .. }
                | EngineEvent::Phase { .. }
                | EngineEvent::Thinking { .. }
                | EngineEvent::ThinkingDone { .. }
                | EngineEvent::Update { .. }
                | EngineEvent::Complete { .. }
        )
    }
}
