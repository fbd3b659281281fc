use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    runtime::{AcceleratorRuntime, Generate, Progress, Tokenize},
    LoadingData,
};

/// Text fed through a freshly loaded model so deferred shader compilation
/// happens before the model is reported ready.
const WARM_UP_TEXT: &str = "User:";

struct Held<R: AcceleratorRuntime> {
    id: String,
    tokenizer: R::Tokenizer,
    model: R::Model,
}

/// The model and tokenizer currently resident on the accelerator.
///
/// At most one model is held. Switching to another identifier releases the
/// previous model's device memory before anything new is loaded; artifacts
/// on disk are never touched.
pub struct ModelResident<R: AcceleratorRuntime> {
    runtime: Arc<R>,
    held: Option<Held<R>>,
}

impl<R: AcceleratorRuntime> ModelResident<R> {
    pub fn new(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            held: None,
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn model_id(&self) -> Option<&str> {
        self.held.as_ref().map(|held| held.id.as_str())
    }

    /// Make `model_id` resident, loading and warming it up if it is not
    /// already held.
    pub async fn acquire(
        &mut self,
        model_id: &str,
        progress: Progress<'_>,
    ) -> Result<(&R::Tokenizer, &mut R::Model)> {
        if self.model_id() != Some(model_id) {
            self.release().await;

            tracing::info!(event = "model_load", model = %model_id, "Loading model");
            progress(LoadingData::message(format!("Loading {model_id}")));
            let tokenizer = self
                .runtime
                .load_tokenizer(model_id, progress)
                .await
                .with_context(|| format!("failed to load tokenizer for `{model_id}`"))?;
            let mut model = self
                .runtime
                .load_model(model_id, progress)
                .await
                .with_context(|| format!("failed to load model `{model_id}`"))?;

            progress(LoadingData::message("Compiling shaders"));
            if let Err(err) = warm_up(&tokenizer, &mut model).await {
                if let Err(err) = model.release().await {
                    tracing::warn!(
                        event = "model_release_failed",
                        model = %model_id,
                        error = %err,
                        "Model release failed"
                    );
                }
                return Err(err.context(format!("warm-up failed for `{model_id}`")));
            }

            tracing::info!(event = "model_loaded", model = %model_id, "Model loaded");
            self.held = Some(Held {
                id: model_id.to_string(),
                tokenizer,
                model,
            });
        }

        self.loaded()
            .context("resident model vanished after load")
    }

    /// The resident pair, if any.
    pub fn loaded(&mut self) -> Option<(&R::Tokenizer, &mut R::Model)> {
        self.held
            .as_mut()
            .map(|held| (&held.tokenizer, &mut held.model))
    }

    /// Release the resident model. A failed release is logged and the
    /// references are dropped regardless.
    pub async fn release(&mut self) {
        let Some(Held { id, model, .. }) = self.held.take() else {
            return;
        };
        match model.release().await {
            Ok(()) => tracing::info!(event = "model_unload", model = %id, "Model released"),
            Err(err) => tracing::warn!(
                event = "model_release_failed",
                model = %id,
                error = %err,
                "Model release failed"
            ),
        }
    }
}

async fn warm_up<T: Tokenize, M: Generate>(tokenizer: &T, model: &mut M) -> Result<()> {
    let tokens = tokenizer.encode(WARM_UP_TEXT)?;
    model.step(&tokens).await?;
    model.clear().await
}
