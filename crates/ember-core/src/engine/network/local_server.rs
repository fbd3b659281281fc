//! OpenAI-compatible inference server on this machine (llama.cpp, vLLM,
//! Ollama and similar).

use anyhow::{bail, Result};
use itertools::Itertools;
use serde::Deserialize;
use serde_json::json;

use super::{ChatProvider, Chunk, Connection};
use crate::{collab, BackendKind, CapabilityInfo, FinishReason, GenerateOptions, Turn};

pub const DEFAULT_URL: &str = "http://127.0.0.1:8080";
pub const CREDENTIAL: &str = "local-server";

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalServer;

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<CompletionUsage>,
    error: Option<ServerError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
    /// llama.cpp and vLLM
    reasoning_content: Option<String>,
    /// Ollama
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: Option<usize>,
    completion_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    message: String,
}

impl LocalServer {
    fn get(&self, connection: &Connection, path: &str) -> reqwest::RequestBuilder {
        let builder = connection.client.get(connection.url(path));
        match &connection.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn models(&self, connection: &Connection) -> Result<Vec<String>> {
        let list: ModelList = self
            .get(connection, "/v1/models")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.data.into_iter().map(|entry| entry.id).collect())
    }
}

impl ChatProvider for LocalServer {
    const KIND: BackendKind = BackendKind::LocalServer;

    fn credential_key(&self) -> &'static str {
        CREDENTIAL
    }

    fn credential_required(&self) -> bool {
        false
    }

    fn settings_key(&self) -> &'static str {
        collab::LOCAL_SERVER_URL
    }

    fn default_url(&self) -> &'static str {
        DEFAULT_URL
    }

    async fn probe(&self, connection: &Connection) -> Result<CapabilityInfo> {
        let models = self.models(connection).await?;
        let mut limits = serde_json::Map::new();
        limits.insert("models".into(), models.len().into());
        Ok(CapabilityInfo {
            vendor: connection.base_url.clone(),
            features: models,
            limits,
        })
    }

    async fn verify_model(&self, connection: &Connection, model_id: &str) -> Result<()> {
        let models = self.models(connection).await?;
        if !models.iter().any(|id| id == model_id) {
            bail!(
                "model `{model_id}` is not served by {}; available: {}",
                connection.base_url,
                models.iter().join(", ")
            );
        }
        Ok(())
    }

    fn request(
        &self,
        connection: &Connection,
        model_id: &str,
        turns: &[Turn],
        options: &GenerateOptions,
    ) -> reqwest::RequestBuilder {
        let body = json!({
            "model": model_id,
            "messages": turns,
            "stream": true,
            "max_tokens": options.max_tokens,
            "stream_options": { "include_usage": true },
            "chat_template_kwargs": { "enable_thinking": options.enable_thinking },
        });
        let builder = connection
            .client
            .post(connection.url("/v1/chat/completions"))
            .json(&body);
        match &connection.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn parse(&self, data: &str) -> Result<Vec<Chunk>> {
        if data == "[DONE]" {
            return Ok(vec![Chunk::Done]);
        }
        let chunk: CompletionChunk = serde_json::from_str(data)?;
        if let Some(error) = chunk.error {
            return Ok(vec![Chunk::Error(error.message)]);
        }

        let mut chunks = Vec::new();
        for choice in chunk.choices {
            let Delta {
                content,
                reasoning_content,
                reasoning,
            } = choice.delta;
            if let Some(text) = reasoning_content.or(reasoning).filter(|text| !text.is_empty()) {
                chunks.push(Chunk::Thinking(text));
            }
            if let Some(text) = content.filter(|text| !text.is_empty()) {
                chunks.push(Chunk::Text(text));
            }
            match choice.finish_reason.as_deref() {
                Some("length") => chunks.push(Chunk::Finish(FinishReason::Length)),
                Some(_) => chunks.push(Chunk::Finish(FinishReason::Stop)),
                None => {}
            }
        }
        if let Some(usage) = chunk.usage {
            chunks.push(Chunk::Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }
        Ok(chunks)
    }
}
