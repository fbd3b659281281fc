//! Structured logging for wide format logging.
//!
//! Events carry an `event` field naming what happened, and each chat turn
//! ends in one canonical log line holding its complete context.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use ember_core::{BackendKind, GenerateOptions, GenerationResult, ModelRef};
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global subscriber. Logs go to stderr so stdout carries only
/// the conversation.
pub fn init(format: LogFormat, filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    }
    .map_err(|err| anyhow!("failed to install logger: {err}"))
}

/// Get current timestamp in milliseconds since Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Application lifecycle events
pub mod lifecycle {
    /// Emitted at startup.
    pub fn app_startup(binary: &str, version: &str) {
        tracing::info!(
            event = "app_startup",
            binary = %binary,
            version = %version,
            "Starting"
        );
    }

    /// Emitted when configuration is loaded.
    pub fn config_loaded(config_path: &str, found: bool) {
        tracing::info!(
            event = "config_loaded",
            config_path = %config_path,
            found = found,
            "Configuration loaded"
        );
    }

    pub fn app_shutdown(reason: &str) {
        tracing::info!(event = "app_shutdown", reason = %reason, "Shutting down");
    }
}

/// Model selection events
pub mod model {
    use ember_core::ModelRef;

    /// Emitted when a model is requested.
    pub fn model_select(model: &ModelRef) {
        tracing::info!(
            event = "model_select",
            backend = %model.kind,
            model = %model.name,
            "Selecting model"
        );
    }

    /// Emitted when the requested model is ready.
    pub fn model_ready(model: &ModelRef, duration_ms: u64) {
        tracing::info!(
            event = "model_ready",
            backend = %model.kind,
            model = %model.name,
            duration_ms = duration_ms,
            "Model ready"
        );
    }
}

/// Error events
pub mod errors {
    pub fn model_load_failed(model: &str, error: &str) {
        tracing::error!(
            event = "model_load_failed",
            model = %model,
            error = %error,
            "Model load failed"
        );
    }

    pub fn capability_check_failed(backend: &str, error: &str) {
        tracing::warn!(
            event = "capability_check_failed",
            backend = %backend,
            error = %error,
            "Capability check failed"
        );
    }

    pub fn invalid_command(input: &str, error: &str) {
        tracing::warn!(
            event = "invalid_command",
            input = %input,
            error = %error,
            "Invalid command"
        );
    }
}

/// Turn context for accumulating metrics over one chat turn.
#[derive(Debug)]
pub struct TurnContext {
    /// UUID7, generated fresh for every turn.
    pub turn_id: String,
    start_time: Instant,
    pub model: String,
    pub backend: Option<BackendKind>,
    pub max_tokens: usize,
    pub enable_thinking: bool,
    /// Number of turns sent, the new user turn included.
    pub message_count: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub tokens_per_second: Option<f64>,
    pub finish: String,
}

impl TurnContext {
    pub fn new(model: Option<&ModelRef>, options: &GenerateOptions, message_count: usize) -> Self {
        Self {
            turn_id: uuid::Uuid::now_v7().to_string(),
            start_time: Instant::now(),
            model: model.map(|model| model.name.clone()).unwrap_or_default(),
            backend: model.map(|model| model.kind),
            max_tokens: options.max_tokens,
            enable_thinking: options.enable_thinking,
            message_count,
            input_tokens: 0,
            output_tokens: 0,
            tokens_per_second: None,
            finish: String::new(),
        }
    }

    /// Record a completed generation.
    pub fn record(&mut self, result: &GenerationResult) {
        self.input_tokens = result.input_tokens;
        self.output_tokens = result.token_count;
        self.tokens_per_second = result.tokens_per_second;
        self.finish = "complete".into();
    }

    /// Record a failed generation.
    pub fn record_error(&mut self, error: &str) {
        self.finish = format!("error: {error}");
    }

    pub fn duration_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Emit the canonical log line for this turn.
    pub fn emit_canonical_log(&self) {
        tracing::info!(
            event = "turn_complete",
            canonical = true,
            timestamp_ms = now_ms(),
            turn_id = %self.turn_id,
            model = %self.model,
            backend = ?self.backend,
            max_tokens = self.max_tokens,
            enable_thinking = self.enable_thinking,
            message_count = self.message_count,
            input_tokens = self.input_tokens,
            output_tokens = self.output_tokens,
            tokens_per_second = ?self.tokens_per_second,
            duration_ms = self.duration_ms(),
            finish = %self.finish,
            "Turn completed"
        );
    }
}
