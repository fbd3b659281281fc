//! Phase detection over a streamed model output.
//!
//! Reasoning models wrap their trace in `<think>...</think>` before the
//! visible answer. [`PhaseDetector`] consumes the output one delta at a time
//! and reports when the stream enters each phase, what belongs to the trace,
//! and what belongs to the answer.
//!
//! Delimiters are matched by substring search over the cumulative output,
//! so a delimiter split across two deltas is found as soon as its second
//! half arrives.

/// Opens the reasoning trace.
pub const THINK_OPEN: &str = "<think>";
/// Closes the reasoning trace.
pub const THINK_CLOSE: &str = "</think>";
/// Answer substituted when the token budget ran out inside the trace.
pub const EXHAUSTED_MESSAGE: &str =
    "reasoning exhausted the token budget; no answer was generated";

/// Deltas tolerated without an open delimiter before the stream is taken
/// to be a plain answer.
const ESCAPE_AFTER_TOKENS: usize = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    /// No delimiter seen yet; early deltas are held back.
    #[default]
    NotStarted,
    /// Inside the reasoning trace.
    Thinking,
    /// Streaming the visible answer.
    Generating,
    /// The session has been finished.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Thinking,
    Generating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Thinking => "thinking",
            Phase::Generating => "generating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    /// The stream entered a phase.
    Phase(Phase),
    /// A delta of the reasoning trace.
    Thinking(String),
    /// The full trimmed trace, emitted once when it closes.
    ThinkingDone(String),
    /// A delta of the visible answer.
    Update(String),
}

/// State machine turning output deltas into [`PhaseEvent`]s.
///
/// One detector serves exactly one session.
#[derive(Debug, Clone, Default)]
pub struct PhaseDetector {
    state: PhaseState,
    /// Everything pushed so far.
    output: String,
    /// Number of non-empty deltas pushed.
    tokens: usize,
    /// Byte offset just past the open delimiter, once seen.
    open_end: Option<usize>,
    /// Reasoning deltas emitted so far.
    thinking: String,
    /// Whether `phase(generating)` has been emitted.
    announced: bool,
    /// Whether any answer text has been emitted.
    answered: bool,
}

impl PhaseDetector {
    /// A detector that looks for a reasoning trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// A detector for sessions with reasoning disabled: every delta is
    /// answer text.
    pub fn passthrough() -> Self {
        Self {
            state: PhaseState::Generating,
            ..Default::default()
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    /// The cumulative output.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Reasoning deltas emitted so far.
    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    /// Feed the next delta and collect the events it causes.
    pub fn push(&mut self, delta: &str) -> Vec<PhaseEvent> {
        let mut events = Vec::new();
        if delta.is_empty() || self.state == PhaseState::Done {
            return events;
        }
        self.output.push_str(delta);
        self.tokens += 1;

        match self.state {
            PhaseState::NotStarted => {
                if let Some(start) = self.output.find(THINK_OPEN) {
                    let open_end = start + THINK_OPEN.len();
                    self.open_end = Some(open_end);
                    self.state = PhaseState::Thinking;
                    events.push(PhaseEvent::Phase(Phase::Thinking));

                    if self.output[open_end..].contains(THINK_CLOSE) {
                        self.close(&mut events);
                    } else if open_end < self.output.len() {
                        let trailing = self.output[open_end..].to_string();
                        self.thinking.push_str(&trailing);
                        events.push(PhaseEvent::Thinking(trailing));
                    }
                } else if self.tokens > ESCAPE_AFTER_TOKENS {
                    // the model is not reasoning; release what was held back
                    self.state = PhaseState::Generating;
                    self.announce(&mut events);
                    self.answered = true;
                    events.push(PhaseEvent::Update(self.output.clone()));
                }
            }
            PhaseState::Thinking => {
                let open_end = self.open_end.unwrap_or_default();
                if self.output[open_end..].contains(THINK_CLOSE) {
                    self.close(&mut events);
                } else {
                    self.thinking.push_str(delta);
                    events.push(PhaseEvent::Thinking(delta.to_string()));
                }
            }
            PhaseState::Generating => {
                self.announce(&mut events);
                self.answer(delta, &mut events);
            }
            PhaseState::Done => {}
        }

        events
    }

    /// End the session.
    ///
    /// An unterminated trace is closed with whatever was buffered; if the
    /// session ran out of budget inside it, [`EXHAUSTED_MESSAGE`] becomes
    /// the answer. Output still held back for delimiter detection is
    /// released as answer text.
    pub fn finish(&mut self, exhausted: bool) -> Vec<PhaseEvent> {
        let mut events = Vec::new();
        match self.state {
            PhaseState::NotStarted if !self.output.is_empty() => {
                self.announce(&mut events);
                self.answered = true;
                events.push(PhaseEvent::Update(self.output.clone()));
            }
            PhaseState::Thinking => {
                let open_end = self.open_end.unwrap_or_default();
                let interior = self.output[open_end..].trim().to_string();
                events.push(PhaseEvent::ThinkingDone(interior));
                if exhausted {
                    events.push(PhaseEvent::Update(EXHAUSTED_MESSAGE.to_string()));
                }
            }
            _ => {}
        }
        self.state = PhaseState::Done;
        events
    }

    fn close(&mut self, events: &mut Vec<PhaseEvent>) {
        let open_end = self.open_end.unwrap_or_default();
        let rest = &self.output[open_end..];
        let Some(end) = rest.find(THINK_CLOSE) else {
            return;
        };
        let interior = rest[..end].trim().to_string();
        let trailing = rest[end + THINK_CLOSE.len()..].to_string();

        self.state = PhaseState::Generating;
        events.push(PhaseEvent::ThinkingDone(interior));
        self.announce(events);
        self.answer(&trailing, events);
    }

    fn announce(&mut self, events: &mut Vec<PhaseEvent>) {
        if !self.announced {
            self.announced = true;
            events.push(PhaseEvent::Phase(Phase::Generating));
        }
    }

    fn answer(&mut self, delta: &str, events: &mut Vec<PhaseEvent>) {
        let text = match self.answered {
            true => delta,
            false => delta.trim_start(),
        };
        if !text.is_empty() {
            self.answered = true;
            events.push(PhaseEvent::Update(text.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn feed(detector: &mut PhaseDetector, chunks: &[&str]) -> Vec<PhaseEvent> {
        chunks
            .iter()
            .flat_map(|chunk| detector.push(chunk))
            .collect()
    }

    /// Collapse runs of `Thinking` and `Update` deltas so sequences can be
    /// compared independently of chunking.
    fn coalesce(events: Vec<PhaseEvent>) -> Vec<PhaseEvent> {
        let mut merged: Vec<PhaseEvent> = Vec::new();
        for event in events {
            if let Some(last) = merged.last_mut() {
                match (last, &event) {
                    (PhaseEvent::Thinking(acc), PhaseEvent::Thinking(next))
                    | (PhaseEvent::Update(acc), PhaseEvent::Update(next)) => {
                        acc.push_str(next);
                        continue;
                    }
                    _ => {}
                }
            }
            merged.push(event);
        }
        merged
    }

    #[rstest]
    #[case(&["<think>", "plan</think>", "answer"])]
    #[case(&["<think>pl", "an</think>ans", "wer"])]
    #[case(&["<thi", "nk>plan</th", "ink>answer"])]
    #[case(&["<think>plan</think>", "\n\nans", "wer"])]
    #[case(&["<", "think>plan</think>answer", ""])]
    #[case(&["<think>plan", "</think>", "answer"])]
    #[case(&["<think>plan</think>answer"])]
    fn test_phase_ordering_across_splits(#[case] chunks: &[&str]) {
        let mut detector = PhaseDetector::new();
        let events = coalesce(feed(&mut detector, chunks));

        let events: Vec<_> = events
            .into_iter()
            .filter(|event| !matches!(event, PhaseEvent::Thinking(_)))
            .collect();
        assert_eq!(
            events,
            vec![
                PhaseEvent::Phase(Phase::Thinking),
                PhaseEvent::ThinkingDone("plan".into()),
                PhaseEvent::Phase(Phase::Generating),
                PhaseEvent::Update("answer".into()),
            ]
        );
        assert_eq!(detector.state(), PhaseState::Generating);
    }

    #[test]
    fn test_thinking_deltas_are_not_cumulative() {
        let mut detector = PhaseDetector::new();
        let events = feed(&mut detector, &["<think>Let", " me", " see"]);
        assert_eq!(
            events,
            vec![
                PhaseEvent::Phase(Phase::Thinking),
                PhaseEvent::Thinking("Let".into()),
                PhaseEvent::Thinking(" me".into()),
                PhaseEvent::Thinking(" see".into()),
            ]
        );
        assert_eq!(detector.thinking(), "Let me see");
    }

    #[test]
    fn test_thinking_done_carries_full_interior() {
        let mut detector = PhaseDetector::new();
        feed(&mut detector, &["<think>\n", "first", " second\n"]);
        let events = detector.push("</think>\n\nDone.");
        assert_eq!(
            events,
            vec![
                PhaseEvent::ThinkingDone("first second".into()),
                PhaseEvent::Phase(Phase::Generating),
                PhaseEvent::Update("Done.".into()),
            ]
        );
    }

    #[test]
    fn test_close_without_trailing_content_emits_no_update() {
        let mut detector = PhaseDetector::new();
        feed(&mut detector, &["<think>", "plan"]);
        let events = detector.push("</think>");
        assert_eq!(
            events,
            vec![
                PhaseEvent::ThinkingDone("plan".into()),
                PhaseEvent::Phase(Phase::Generating),
            ]
        );
        // leading whitespace before the answer is dropped, then deltas flow
        assert!(detector.push("\n\n").is_empty());
        assert_eq!(detector.push(" Hi"), vec![PhaseEvent::Update("Hi".into())]);
        assert_eq!(detector.push(" there"), vec![PhaseEvent::Update(" there".into())]);
    }

    #[test]
    fn test_escape_rule_without_open_delimiter() {
        let mut detector = PhaseDetector::new();
        assert!(detector.push("The").is_empty());
        assert!(detector.push(" answer").is_empty());
        assert!(detector.push(" is").is_empty());

        let events = detector.push(" 42");
        assert_eq!(
            events,
            vec![
                PhaseEvent::Phase(Phase::Generating),
                PhaseEvent::Update("The answer is 42".into()),
            ]
        );

        assert_eq!(detector.push("."), vec![PhaseEvent::Update(".".into())]);
        assert_eq!(detector.state(), PhaseState::Generating);
    }

    #[test]
    fn test_budget_exhausted_inside_thinking() {
        let mut detector = PhaseDetector::new();
        feed(&mut detector, &["<think>", "step one", " step two"]);

        let events = detector.finish(true);
        assert_eq!(
            events,
            vec![
                PhaseEvent::ThinkingDone("step one step two".into()),
                PhaseEvent::Update(EXHAUSTED_MESSAGE.into()),
            ]
        );
        assert_eq!(detector.state(), PhaseState::Done);
        assert!(detector.push("late").is_empty());
    }

    #[test]
    fn test_stop_inside_thinking_has_no_diagnostic() {
        let mut detector = PhaseDetector::new();
        feed(&mut detector, &["<think>", "partial"]);
        assert_eq!(
            detector.finish(false),
            vec![PhaseEvent::ThinkingDone("partial".into())]
        );
    }

    #[test]
    fn test_finish_flushes_short_plain_answer() {
        let mut detector = PhaseDetector::new();
        assert!(feed(&mut detector, &["Hi", "!"]).is_empty());
        assert_eq!(
            detector.finish(false),
            vec![
                PhaseEvent::Phase(Phase::Generating),
                PhaseEvent::Update("Hi!".into()),
            ]
        );
    }

    #[test]
    fn test_finish_after_answer_is_silent() {
        let mut detector = PhaseDetector::new();
        feed(&mut detector, &["<think>a</think>b"]);
        assert!(detector.finish(true).is_empty());
    }

    #[test]
    fn test_passthrough() {
        let mut detector = PhaseDetector::passthrough();
        assert_eq!(
            detector.push("Hello"),
            vec![
                PhaseEvent::Phase(Phase::Generating),
                PhaseEvent::Update("Hello".into()),
            ]
        );
        assert_eq!(detector.push(" world"), vec![PhaseEvent::Update(" world".into())]);
        assert!(detector.finish(false).is_empty());
    }

    #[test]
    fn test_empty_deltas_do_not_count_as_tokens() {
        let mut detector = PhaseDetector::new();
        for _ in 0..10 {
            assert!(detector.push("").is_empty());
        }
        assert_eq!(detector.state(), PhaseState::NotStarted);
    }
}
