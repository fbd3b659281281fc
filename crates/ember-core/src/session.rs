//! Per-session event assembly shared by every backend.

use tokio::time::Instant;

use crate::{
    phase::{PhaseDetector, PhaseEvent, PhaseState, THINK_CLOSE, THINK_OPEN},
    EngineEvent, FinishReason, GenerateOptions, TokenStats,
};

/// Turns the text produced by one generation into the outbound event
/// sequence `start → phase/thinking/update* → complete`.
#[derive(Debug)]
pub struct Session {
    detector: PhaseDetector,
    enable_thinking: bool,
    /// Whether the open delimiter was synthesised for explicit reasoning deltas.
    synthetic: bool,
    /// Set when the first output token is recorded.
    instant: Option<Instant>,
    token_count: usize,
    input_tokens: usize,
}

impl Session {
    pub fn new(options: &GenerateOptions) -> Self {
        let detector = match options.enable_thinking {
            true => PhaseDetector::new(),
            false => PhaseDetector::passthrough(),
        };
        Self {
            detector,
            enable_thinking: options.enable_thinking,
            synthetic: false,
            instant: None,
            token_count: 0,
            input_tokens: 0,
        }
    }

    pub fn start(&mut self, input_tokens: usize) -> EngineEvent {
        self.input_tokens = input_tokens;
        EngineEvent::Start { input_tokens }
    }

    /// Count one produced token.
    pub fn record_token(&mut self) {
        self.instant.get_or_insert_with(Instant::now);
        self.token_count += 1;
    }

    /// Replace local counts with the ones a server reported.
    pub fn record_usage(&mut self, input_tokens: Option<usize>, output_tokens: Option<usize>) {
        if let Some(input) = input_tokens {
            self.input_tokens = input;
        }
        if let Some(output) = output_tokens {
            self.token_count = output;
        }
    }

    pub fn input_tokens(&self) -> usize {
        self.input_tokens
    }

    pub fn stats(&self) -> TokenStats {
        let tokens_per_second = self
            .instant
            .map(|instant| instant.elapsed().as_secs_f64())
            .filter(|secs| *secs > 0.0)
            .map(|secs| self.token_count as f64 / secs);
        TokenStats {
            tokens_per_second,
            token_count: self.token_count,
        }
    }

    /// Feed decoded model output, which may carry inline delimiters.
    pub fn push_text(&mut self, delta: &str) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if self.synthetic && self.detector.state() == PhaseState::Thinking {
            let phase_events = self.detector.push(THINK_CLOSE);
            events.extend(self.convert(phase_events));
        }
        let phase_events = self.detector.push(delta);
        events.extend(self.convert(phase_events));
        events
    }

    /// Feed a delta a backend reported explicitly as reasoning.
    pub fn push_reasoning(&mut self, delta: &str) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if !self.enable_thinking || delta.is_empty() {
            return events;
        }
        if self.detector.state() == PhaseState::NotStarted {
            self.synthetic = true;
            let phase_events = self.detector.push(THINK_OPEN);
            events.extend(self.convert(phase_events));
        }
        if self.detector.state() == PhaseState::Thinking {
            let phase_events = self.detector.push(delta);
            events.extend(self.convert(phase_events));
        }
        events
    }

    /// Close the session; the last event is always `complete`.
    pub fn finish(mut self, reason: FinishReason) -> Vec<EngineEvent> {
        let exhausted = reason == FinishReason::Length;
        let phase_events = self.detector.finish(exhausted);
        let mut events = self.convert(phase_events);

        let TokenStats {
            tokens_per_second,
            token_count,
        } = self.stats();
        tracing::debug!(
            event = "session_finish",
            reason = ?reason,
            token_count,
            input_tokens = self.input_tokens,
            thinking_text = %self.detector.thinking(),
            output_text = %self.detector.output(),
            "Generation session finished"
        );
        events.push(EngineEvent::Complete {
            tokens_per_second,
            token_count,
            input_tokens: self.input_tokens,
        });
        events
    }

    fn convert(&self, events: Vec<PhaseEvent>) -> Vec<EngineEvent> {
        events
            .into_iter()
            .map(|event| match event {
                PhaseEvent::Phase(phase) => EngineEvent::Phase {
                    name: phase.as_str().to_string(),
                },
                PhaseEvent::Thinking(content) => EngineEvent::Thinking { content },
                PhaseEvent::ThinkingDone(content) => EngineEvent::ThinkingDone { content },
                PhaseEvent::Update(output) => {
                    let TokenStats {
                        tokens_per_second,
                        token_count,
                    } = self.stats();
                    EngineEvent::Update {
                        output,
                        tokens_per_second,
                        token_count,
                    }
                }
            })
            .collect()
    }
}
