//! Contract: idempotent resume. A document interrupted after the k-th
//! question of a variant resumes in place with no duplicate question ids,
//! in suite order, and the document parses at every variant boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quantbench_core::cancel::CancelController;
use quantbench_core::client::GenerateOutcome;
use quantbench_core::errors::ClientError;
use quantbench_core::judge::orchestrator::{JudgeMode, JudgeOrchestrator};
use quantbench_core::model::{ResultsDocument, TokenLogprob};
use quantbench_core::retry::{AutoExtend, CallKernel};
use quantbench_core::runner::{Generate, TestRunner};
use quantbench_core::store::ResultsStore;
use quantbench_core::{Reporter, RunOptions, TestSuite};
use tokio_util::sync::CancellationToken;

struct EchoGenerator;

#[async_trait]
impl Generate for EchoGenerator {
    async fn generate(
        &self,
        _model: &str,
        prompt: &str,
        _options: &RunOptions,
        _num_ctx: u64,
        _num_predict: u64,
    ) -> Result<GenerateOutcome, ClientError> {
        Ok(GenerateOutcome {
            answer: format!("echo: {prompt}"),
            logprobs: vec![TokenLogprob {
                token: "x".into(),
                logprob: -0.1,
            }],
            eval_count: 10,
            eval_duration_ns: 1_000_000_000,
            prompt_eval_count: 5,
            prompt_eval_duration_ns: 500_000_000,
        })
    }
}

fn idle_orchestrator() -> JudgeOrchestrator {
    JudgeOrchestrator::new(
        None,
        None,
        JudgeMode::Serial,
        false,
        false,
        false,
        Reporter::default(),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn interrupted_variant_resumes_without_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultsStore::new(dir.path().join("llama3.1.qc.json"));
    let suite = TestSuite::builtin();
    let options = RunOptions::default();
    let cancel = CancelController::new();
    let kernel = CallKernel::new(cancel.token(), Duration::from_secs(30), Arc::new(AutoExtend));
    let reporter = Reporter::default();
    let gate = Arc::new(tokio::sync::Mutex::new(()));

    let runner = TestRunner {
        generator: &EchoGenerator,
        kernel: &kernel,
        suite: &suite,
        options: &options,
        reporter: &reporter,
        server_gate: &gate,
    };

    // First pass: answer everything, then keep only the first 3 answers to
    // simulate a kill after the 3rd persisted question.
    let (mut doc, created) = store
        .open_or_create(&suite.name, "llama3.1", &options)
        .await
        .expect("create");
    assert!(created);
    let mut orch = idle_orchestrator();
    runner
        .run_variant(&mut doc, "q4_0", "llama3.1:q4_0", &mut orch, None)
        .await
        .expect("first pass");
    doc.variant_mut("q4_0").unwrap().questions.truncate(3);
    store.save(&doc).await.expect("save partial");

    // The on-disk state parses as a whole.
    let raw = std::fs::read_to_string(store.path()).expect("read");
    serde_json::from_str::<ResultsDocument>(&raw).expect("partial document parses");

    // Second pass with identical arguments resumes in place.
    let (mut doc, created) = store
        .open_or_create(&suite.name, "llama3.1", &options)
        .await
        .expect("reopen");
    assert!(!created);
    assert_eq!(doc.variant("q4_0").unwrap().questions.len(), 3);

    let mut orch = idle_orchestrator();
    runner
        .run_variant(&mut doc, "q4_0", "llama3.1:q4_0", &mut orch, None)
        .await
        .expect("resume");
    store.save(&doc).await.expect("save full");

    let v = doc.variant("q4_0").expect("variant");
    assert_eq!(v.questions.len(), suite.total_questions());

    let expected: Vec<&str> = suite.question_ids().collect();
    let actual: Vec<&str> = v.questions.iter().map(|q| q.question_id.as_str()).collect();
    assert_eq!(actual, expected, "suite order, no duplicates");

    // Answered-before results were not overwritten on resume.
    assert!(v.questions[0].answer.starts_with("echo: "));
}

#[tokio::test]
async fn base_answer_map_feeds_parallel_judging() {
    // Parallel-mode plumbing: questions completed by the runner enqueue a
    // background similarity task per answer when base answers exist.
    let suite = TestSuite::builtin();
    let options = RunOptions::default();
    let cancel = CancelController::new();
    let kernel = CallKernel::new(cancel.token(), Duration::from_secs(30), Arc::new(AutoExtend));
    let reporter = Reporter::default();
    let gate = Arc::new(tokio::sync::Mutex::new(()));

    let runner = TestRunner {
        generator: &EchoGenerator,
        kernel: &kernel,
        suite: &suite,
        options: &options,
        reporter: &reporter,
        server_gate: &gate,
    };

    let mut doc = ResultsDocument::new(suite.name.clone(), "llama3.1", options.clone());
    let mut orch = idle_orchestrator();
    runner
        .run_variant(&mut doc, "fp16", "llama3.1:fp16", &mut orch, None)
        .await
        .expect("base run");
    doc.variant_mut("fp16").unwrap().is_base = true;

    let base_answers: HashMap<String, String> = doc
        .base_variant()
        .unwrap()
        .questions
        .iter()
        .map(|q| (q.question_id.clone(), q.answer.clone()))
        .collect();
    assert_eq!(base_answers.len(), suite.total_questions());
    assert!(base_answers.values().all(|a| a.starts_with("echo: ")));
}
