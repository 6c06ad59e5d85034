//! Progress reporting surfaces. The engine emits typed events through
//! sinks; the console layer decides how to render them. Core code never
//! touches a terminal.

use std::sync::Arc;

/// Per-variant test progress, counted in answered questions.
#[derive(Debug, Clone)]
pub struct TestProgress {
    pub tag: String,
    pub done: usize,
    pub total: usize,
}

/// Judgment progress across the run; background tasks increment this
/// independently of the test counter.
#[derive(Debug, Clone, Copy)]
pub struct JudgeProgress {
    pub done: usize,
    pub total: usize,
}

/// One streamed pull status record, already decoded.
#[derive(Debug, Clone)]
pub struct PullProgress {
    pub model: String,
    pub status: String,
    pub digest: Option<String>,
    pub completed: u64,
    pub total: u64,
}

pub type TestSink = Arc<dyn Fn(TestProgress) + Send + Sync>;
pub type JudgeSink = Arc<dyn Fn(JudgeProgress) + Send + Sync>;
pub type PullSink = Arc<dyn Fn(PullProgress) + Send + Sync>;
pub type MessageSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Bundle of sinks handed to the engine. Defaults are no-ops so library
/// callers and tests can run silent.
#[derive(Clone)]
pub struct Reporter {
    pub on_test: TestSink,
    pub on_judge: JudgeSink,
    pub on_pull: PullSink,
    pub on_message: MessageSink,
}

impl Default for Reporter {
    fn default() -> Self {
        Self {
            on_test: Arc::new(|_| {}),
            on_judge: Arc::new(|_| {}),
            on_pull: Arc::new(|_| {}),
            on_message: Arc::new(|_| {}),
        }
    }
}

impl Reporter {
    pub fn message(&self, text: impl AsRef<str>) {
        (self.on_message)(text.as_ref());
    }
}
