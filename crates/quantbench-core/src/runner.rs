//! Per-variant test driver: iterates the suite in order, skips already
//! answered questions, generates with logprob capture, records timings,
//! and in parallel judge mode hands every fresh answer to the background
//! judge pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{GenerateOutcome, InferenceClient};
use crate::errors::ClientError;
use crate::judge::orchestrator::{JudgeMode, JudgeOrchestrator, PairJob};
use crate::model::{QuestionResult, ResultsDocument, RunOptions, VariantResult};
use crate::progress::{Reporter, TestProgress};
use crate::retry::{CallKernel, RetryPolicy};
use crate::suite::TestSuite;

/// Generation seam; the inference client implements it, tests script it.
#[async_trait]
pub trait Generate: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &RunOptions,
        num_ctx: u64,
        num_predict: u64,
    ) -> Result<GenerateOutcome, ClientError>;
}

#[async_trait]
impl Generate for InferenceClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &RunOptions,
        num_ctx: u64,
        num_predict: u64,
    ) -> Result<GenerateOutcome, ClientError> {
        InferenceClient::generate(self, model, prompt, options, num_ctx, num_predict).await
    }
}

pub struct TestRunner<'a> {
    pub generator: &'a dyn Generate,
    pub kernel: &'a CallKernel,
    pub suite: &'a TestSuite,
    pub options: &'a RunOptions,
    pub reporter: &'a Reporter,
    /// Serializes generation against the shared server; a same-endpoint
    /// judge holds the same lock.
    pub server_gate: &'a Arc<tokio::sync::Mutex<()>>,
}

impl TestRunner<'_> {
    /// Run every unanswered question of the variant, appending results in
    /// suite order. The partial record lives in the document the whole
    /// time, so a cancellation save keeps it.
    pub async fn run_variant(
        &self,
        doc: &mut ResultsDocument,
        tag: &str,
        model_name: &str,
        orchestrator: &mut JudgeOrchestrator,
        base_answers: Option<&HashMap<String, String>>,
    ) -> Result<(), ClientError> {
        if doc.variant(tag).is_none() {
            doc.upsert_variant(VariantResult::new(tag, model_name));
        }
        let answered: HashSet<String> = doc
            .variant(tag)
            .map(|v| v.questions.iter().map(|q| q.question_id.clone()).collect())
            .unwrap_or_default();
        let is_base = doc.variant(tag).map(|v| v.is_base).unwrap_or(false);

        let total = self.suite.total_questions();
        let mut done = answered.len();
        (self.reporter.on_test)(TestProgress {
            tag: tag.to_string(),
            done,
            total,
        });

        let cancel = self.kernel.cancel_token();
        let mut prev_ctx: Option<u64> = None;
        for category in &self.suite.categories {
            for question in &category.questions {
                if answered.contains(&question.id) {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }

                let ctx = self.suite.resolve_ctx(category, question);
                if prev_ctx.is_some() && prev_ctx != Some(ctx) {
                    self.reporter
                        .message(format!("context length is now {ctx} (question {})", question.id));
                }
                prev_ctx = Some(ctx);

                let outcome = self
                    .kernel
                    .call("generate", RetryPolicy::normal(), || async {
                        let _serialized = self.server_gate.lock().await;
                        self.generator
                            .generate(
                                model_name,
                                &question.prompt,
                                self.options,
                                ctx,
                                self.suite.max_predict,
                            )
                            .await
                    })
                    .await?;

                let answer = outcome.answer.clone();
                let result = QuestionResult {
                    question_id: question.id.clone(),
                    category: category.name.clone(),
                    prompt: question.prompt.clone(),
                    answer: outcome.answer,
                    logprobs: outcome.logprobs,
                    eval_tokens_per_second: per_second(outcome.eval_count, outcome.eval_duration_ns),
                    prompt_tokens_per_second: per_second(
                        outcome.prompt_eval_count,
                        outcome.prompt_eval_duration_ns,
                    ),
                    total_tokens: outcome.eval_count + outcome.prompt_eval_count,
                    ctx_size: ctx,
                    judgment: None,
                };
                doc.variant_mut(tag)
                    .expect("variant ensured above")
                    .questions
                    .push(result);

                done += 1;
                (self.reporter.on_test)(TestProgress {
                    tag: tag.to_string(),
                    done,
                    total,
                });

                if orchestrator.mode == JudgeMode::Parallel && !is_base {
                    if let Some(base_answer) =
                        base_answers.and_then(|answers| answers.get(&question.id))
                    {
                        orchestrator.spawn_similarity(PairJob {
                            tag: tag.to_string(),
                            question_id: question.id.clone(),
                            question: question.prompt.clone(),
                            base_answer: base_answer.clone(),
                            variant_answer: answer,
                            test_ctx: ctx,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn per_second(count: u64, duration_ns: u64) -> f64 {
    if duration_ns == 0 {
        0.0
    } else {
        count as f64 / (duration_ns as f64 / 1e9)
    }
}
