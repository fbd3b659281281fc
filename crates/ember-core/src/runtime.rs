//! The seam between the accelerator worker and the inference runtime that
//! actually runs a model on the device.

use std::future::Future;

use anyhow::Result;

use crate::{CapabilityInfo, LoadingData, Role, Turn};

/// Callback receiving artifact fetch progress during a load.
pub type Progress<'a> = &'a (dyn Fn(LoadingData) + Send + Sync);

pub trait Tokenize: Send + Sync + 'static {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Raw bytes for `tokens`; a single token may end inside a UTF-8 sequence.
    fn decode(&self, tokens: &[u32]) -> Result<Vec<u8>>;
}

/// A loaded model holding per-session recurrent state.
pub trait Generate: Send + 'static {
    /// Feed `tokens` and return the next token, or `None` for the end token.
    fn step(&mut self, tokens: &[u32]) -> impl Future<Output = Result<Option<u32>>> + Send;

    /// Reset the recurrent state before a new session.
    fn clear(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Free device memory held by the model.
    fn release(self) -> impl Future<Output = Result<()>> + Send;
}

pub trait AcceleratorRuntime: Send + Sync + 'static {
    type Tokenizer: Tokenize;
    type Model: Generate;

    fn has_capability(&self) -> impl Future<Output = bool> + Send;

    fn describe_capability(&self) -> impl Future<Output = Result<CapabilityInfo>> + Send;

    fn load_tokenizer(
        &self,
        model_id: &str,
        progress: Progress<'_>,
    ) -> impl Future<Output = Result<Self::Tokenizer>> + Send;

    fn load_model(
        &self,
        model_id: &str,
        progress: Progress<'_>,
    ) -> impl Future<Output = Result<Self::Model>> + Send;

    fn render_prompt(&self, turns: &[Turn], enable_thinking: bool) -> String {
        render_chat_prompt(turns, enable_thinking)
    }
}

/// Collapse runs of newlines; a blank line separates chat rounds.
pub fn normalize_newlines(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_newline = false;
    for c in text.chars() {
        if c == '\n' {
            if !prev_was_newline {
                result.push('\n');
            }
            prev_was_newline = true;
        } else {
            result.push(c);
            prev_was_newline = false;
        }
    }
    result
}

/// Render turns in the chat format of RWKV G1 models:
///
/// ```text
/// System: SYSTEM_PROMPT
///
/// User: USER_MESSAGE think
///
/// Assistant:
/// ```
///
/// With thinking disabled the last user turn carries no `think` suffix and
/// the assistant turn is prefilled with an empty reasoning block.
pub fn render_chat_prompt(turns: &[Turn], enable_thinking: bool) -> String {
    let mut prompt = String::new();
    let last_user = turns.iter().rposition(|turn| turn.role == Role::User);
    for (index, turn) in turns.iter().enumerate() {
        let content = normalize_newlines(turn.content.trim());
        let suffix = match enable_thinking && Some(index) == last_user {
            true => " think",
            false => "",
        };
        prompt.push_str(&format!("{}: {content}{suffix}\n\n", turn.role));
    }
    match enable_thinking {
        true => prompt.push_str("Assistant:"),
        false => prompt.push_str("Assistant: <think>\n</think>"),
    }
    prompt
}
