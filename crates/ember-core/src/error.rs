//! Error types surfaced by façades and the router.

use thiserror::Error;

use crate::EngineStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Missing credential, unreachable backend, artifact fetch or warm-up failure.
    #[error("load failed: {0}")]
    Load(String),
    /// Transport failure, malformed chunk, or a failure reported by the backend.
    #[error("generation failed: {0}")]
    Generation(String),
    /// The device cannot run the accelerator backend.
    #[error("capability unavailable: {0}")]
    Capability(String),
    #[error("no credential available for `{0}`")]
    MissingCredential(String),
    #[error("engine is {0}")]
    NotReady(crate::EngineStatus),
    #[error("no backend is active; load a model first")]
    NoActiveBackend,
    #[error("invalid model reference `{0}`")]
    InvalidModelRef(String),
    #[error("engine terminated")]
    Terminated,
}

impl EngineError {
    pub fn not_ready(status: EngineStatus) -> Self {
        Self::NotReady(status)
    }
}
