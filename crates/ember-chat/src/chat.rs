//! The pieces of the terminal chat loop that do not touch the terminal.

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use ember_core::{EngineError, EngineEvent, Listener, ModelRef, Turn};

pub const HELP: &str = "\
/model KIND:REF  switch model (accelerator:, local-server:, remote-api:)
/check           probe the active backend
/reset           forget the conversation
/quit            exit
Ctrl-C interrupts a reply in progress.";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Model(ModelRef),
    Check,
    Reset,
    Help,
    Quit,
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Result<Self, EngineError> {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            return match line.is_empty() {
                true => Ok(Input::Empty),
                false => Ok(Input::Message(line.to_string())),
            };
        };
        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map(|(name, argument)| (name, argument.trim()))
            .unwrap_or((command, ""));
        match name {
            "model" => Ok(Input::Model(argument.parse()?)),
            "check" => Ok(Input::Check),
            "reset" => Ok(Input::Reset),
            "help" => Ok(Input::Help),
            "quit" | "exit" => Ok(Input::Quit),
            _ => Ok(Input::Message(line.to_string())),
        }
    }
}

/// The turns of the running conversation.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    system: Option<String>,
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(system: Option<String>) -> Self {
        Self {
            system: system.filter(|system| !system.trim().is_empty()),
            turns: Vec::new(),
        }
    }

    /// The turns to send, system prompt first.
    pub fn turns(&self) -> Vec<Turn> {
        self.system
            .iter()
            .map(Turn::system)
            .chain(self.turns.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::user(content));
    }

    /// Close the pending user turn with the assistant's answer.
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::assistant(content));
    }

    /// Drop a user turn that got no answer.
    pub fn retract(&mut self) {
        if self
            .turns
            .last()
            .is_some_and(|turn| turn.role == ember_core::Role::User)
        {
            self.turns.pop();
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Human-readable text for an event, if it shows anything.
pub fn render(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::Loading { data } => Some(match data.progress {
            Some(progress) => format!("[loading] {} ({:.0}%)\n", data.message, progress * 100.0),
            None => format!("[loading] {}\n", data.message),
        }),
        EngineEvent::Ready => Some("[ready]\n".into()),
        EngineEvent::CapabilityInfo { data } => {
            let mut text = format!("[capability] {}\n", data.vendor);
            for feature in &data.features {
                text.push_str(&format!("  {feature}\n"));
            }
            for (key, value) in &data.limits {
                text.push_str(&format!("  {key} = {value}\n"));
            }
            Some(text)
        }
        EngineEvent::Phase { name } if name == "thinking" => Some("(thinking) ".into()),
        EngineEvent::Phase { .. } => Some("\n".into()),
        EngineEvent::Thinking { content } => Some(content.clone()),
        EngineEvent::Update { output, .. } => Some(output.clone()),
        EngineEvent::Complete {
            tokens_per_second,
            token_count,
            ..
        } => Some(match tokens_per_second {
            Some(tps) => format!("\n[{token_count} tokens, {tps:.1} tok/s]\n"),
            None => format!("\n[{token_count} tokens]\n"),
        }),
        EngineEvent::Error { message } => Some(format!("\n[error] {message}\n")),
        EngineEvent::Start { .. } | EngineEvent::ThinkingDone { .. } => None,
    }
}

/// A listener writing every event to `out`, as text or as one JSON line
/// per event.
pub fn printer<W: Write + Send + 'static>(out: W, json: bool) -> Listener {
    let out = Arc::new(Mutex::new(out));
    Arc::new(move |event: &EngineEvent| {
        let text = match json {
            true => serde_json::to_string(event).ok().map(|line| line + "\n"),
            false => render(event),
        };
        if let Some(text) = text {
            let mut out = out.lock().unwrap_or_else(|err| err.into_inner());
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    })
}
