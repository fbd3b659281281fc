//! Hosted Anthropic Messages API, streamed.

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;

use super::{ChatProvider, Chunk, Connection};
use crate::{collab, BackendKind, CapabilityInfo, FinishReason, GenerateOptions, Role, Turn};

pub const DEFAULT_URL: &str = "https://api.anthropic.com";
pub const CREDENTIAL: &str = "anthropic";
pub const API_VERSION: &str = "2023-06-01";
/// Smallest reasoning budget the API accepts.
pub const MIN_THINKING_BUDGET: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteApi;

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockDelta {
        delta: ContentDelta,
    },
    MessageDelta {
        delta: MessageDeltaData,
        usage: Option<OutputUsage>,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    /// `ping`, `content_block_start`, `content_block_stop` and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Option<InputUsage>,
}

#[derive(Debug, Deserialize)]
struct InputUsage {
    input_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    /// `signature_delta`, `input_json_delta`
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaData {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    output_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Reasoning budget for a request of `max_tokens`, if the request leaves
/// room for one.
pub fn thinking_budget(max_tokens: usize) -> Option<usize> {
    let budget = max_tokens / 2;
    (budget >= MIN_THINKING_BUDGET).then_some(budget)
}

impl RemoteApi {
    fn authorize(&self, connection: &Connection, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", API_VERSION);
        match &connection.token {
            Some(token) => builder.header("x-api-key", token),
            None => builder,
        }
    }
}

impl ChatProvider for RemoteApi {
    const KIND: BackendKind = BackendKind::RemoteApi;

    fn credential_key(&self) -> &'static str {
        CREDENTIAL
    }

    fn credential_required(&self) -> bool {
        true
    }

    fn settings_key(&self) -> &'static str {
        collab::REMOTE_API_URL
    }

    fn default_url(&self) -> &'static str {
        DEFAULT_URL
    }

    async fn probe(&self, connection: &Connection) -> Result<CapabilityInfo> {
        let builder = connection.client.get(connection.url("/v1/models"));
        let list: ModelList = self
            .authorize(connection, builder)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut limits = serde_json::Map::new();
        limits.insert("minThinkingBudget".into(), MIN_THINKING_BUDGET.into());
        Ok(CapabilityInfo {
            vendor: "anthropic".into(),
            features: list.data.into_iter().map(|entry| entry.id).collect(),
            limits,
        })
    }

    async fn verify_model(&self, connection: &Connection, model_id: &str) -> Result<()> {
        let builder = connection
            .client
            .get(connection.url(&format!("/v1/models/{model_id}")));
        self.authorize(connection, builder)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn request(
        &self,
        connection: &Connection,
        model_id: &str,
        turns: &[Turn],
        options: &GenerateOptions,
    ) -> reqwest::RequestBuilder {
        let system = turns
            .iter()
            .filter(|turn| turn.role == Role::System)
            .map(|turn| turn.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages: Vec<_> = turns
            .iter()
            .filter(|turn| turn.role != Role::System)
            .collect();

        let mut body = json!({
            "model": model_id,
            "max_tokens": options.max_tokens,
            "messages": messages,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = system.into();
        }
        if let Some(budget) = thinking_budget(options.max_tokens).filter(|_| options.enable_thinking) {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }

        let builder = connection
            .client
            .post(connection.url("/v1/messages"))
            .json(&body);
        self.authorize(connection, builder)
    }

    fn parse(&self, data: &str) -> Result<Vec<Chunk>> {
        let chunks = match serde_json::from_str::<StreamEvent>(data)? {
            StreamEvent::MessageStart { message } => vec![Chunk::Usage {
                input_tokens: message.usage.and_then(|usage| usage.input_tokens),
                output_tokens: None,
            }],
            StreamEvent::ContentBlockDelta { delta } => match delta {
                ContentDelta::TextDelta { text } => vec![Chunk::Text(text)],
                ContentDelta::ThinkingDelta { thinking } => vec![Chunk::Thinking(thinking)],
                ContentDelta::Other => vec![],
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let reason = match delta.stop_reason.as_deref() {
                    Some("max_tokens") => FinishReason::Length,
                    _ => FinishReason::Stop,
                };
                let mut chunks = vec![Chunk::Finish(reason)];
                if let Some(OutputUsage {
                    output_tokens: Some(output_tokens),
                }) = usage
                {
                    chunks.push(Chunk::Usage {
                        input_tokens: None,
                        output_tokens: Some(output_tokens),
                    });
                }
                chunks
            }
            StreamEvent::MessageStop => vec![Chunk::Done],
            StreamEvent::Error { error } => vec![Chunk::Error(error.message)],
            StreamEvent::Other => {
                tracing::trace!(event = "stream_event_ignored", data = %data, "Ignored stream event");
                vec![]
            }
        };
        Ok(chunks)
    }
}
