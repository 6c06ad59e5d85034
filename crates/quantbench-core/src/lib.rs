//! Quantbench core: the test-and-judge orchestration engine behind the
//! `quantbench` CLI. Runs a fixed question battery against quantized
//! variants of a model served by an Ollama-style inference server and
//! judges each variant's answers against a baseline variant.

pub mod cancel;
pub mod client;
pub mod engine;
pub mod errors;
pub mod judge;
pub mod lifecycle;
pub mod model;
pub mod progress;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod store;
pub mod suite;

pub use cancel::{CancelController, CancelStage};
pub use engine::{EngineConfig, EngineExit, QcEngine, RunSummary, VariantSummary};
pub use engine::{EXIT_CANCELLED, EXIT_ERROR, EXIT_SUCCESS};
pub use errors::ClientError;
pub use judge::orchestrator::JudgeMode;
pub use model::{ResultsDocument, RunOptions};
pub use progress::{JudgeProgress, PullProgress, Reporter, TestProgress};
pub use retry::{TimeoutArbiter, TimeoutVerdict};
pub use store::recovery::{repair_document, RepairStats};
pub use suite::TestSuite;
