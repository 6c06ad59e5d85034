//! Judge orchestration: decides what gets judged with which identity,
//! runs the similarity and best-answer passes serially or as background
//! tasks, and merges verdicts into the results document at well-defined
//! drain points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;
use crate::model::{Judgment, QuestionResult, ResultsDocument, VariantResult};
use crate::model::results::now_rfc3339ish;
use crate::progress::{JudgeProgress, Reporter};

use super::prompt::{pair_prompt, BEST_ANSWER_SYSTEM, SIMILARITY_SYSTEM};
use super::{JudgeClient, JudgeIdentity, Verdict, JUDGE_MAX_TOKENS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeMode {
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgePass {
    Similarity,
    BestAnswer,
}

/// One question pair handed to a judge.
#[derive(Debug, Clone)]
pub struct PairJob {
    pub tag: String,
    pub question_id: String,
    pub question: String,
    pub base_answer: String,
    pub variant_answer: String,
    pub test_ctx: u64,
}

#[derive(Debug)]
struct JudgeOutcome {
    tag: String,
    question_id: String,
    pass: JudgePass,
    verdict: Verdict,
    identity: JudgeIdentity,
}

pub struct JudgeOrchestrator {
    judge: Option<JudgeClient>,
    judge_best: Option<JudgeClient>,
    pub mode: JudgeMode,
    force: bool,
    rejudge: bool,
    verbose: bool,
    reporter: Reporter,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    tx: mpsc::UnboundedSender<JudgeOutcome>,
    rx: mpsc::UnboundedReceiver<JudgeOutcome>,
    pending_by_tag: Arc<Mutex<HashMap<String, usize>>>,
    scheduled: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
}

impl JudgeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        judge: Option<JudgeClient>,
        judge_best: Option<JudgeClient>,
        mode: JudgeMode,
        force: bool,
        rejudge: bool,
        verbose: bool,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            judge,
            judge_best,
            mode,
            force,
            rejudge,
            verbose,
            reporter,
            cancel,
            tasks: JoinSet::new(),
            tx,
            rx,
            pending_by_tag: Arc::new(Mutex::new(HashMap::new())),
            scheduled: Arc::new(AtomicUsize::new(0)),
            done: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.judge.is_some()
    }

    pub fn best_enabled(&self) -> bool {
        self.judge_best.is_some()
    }

    pub fn identity(&self) -> Option<JudgeIdentity> {
        self.judge.as_ref().map(JudgeClient::identity)
    }

    pub fn best_identity(&self) -> Option<JudgeIdentity> {
        self.judge_best.as_ref().map(JudgeClient::identity)
    }

    fn same_identity(judgment: &Judgment, id: &JudgeIdentity) -> bool {
        judgment.judge_model == id.model
            && judgment.judge_provider.as_deref() == Some(id.provider.as_str())
    }

    fn question_needs_similarity(&self, q: &QuestionResult) -> bool {
        let Some(id) = self.identity() else { return false };
        if self.force || self.rejudge {
            return true;
        }
        match &q.judgment {
            None => true,
            // A judgment produced by a different judge identity counts as
            // missing.
            Some(j) => !Self::same_identity(j, &id),
        }
    }

    fn question_needs_best(&self, q: &QuestionResult) -> bool {
        let Some(id) = self.best_identity() else { return false };
        if self.force || self.rejudge {
            return true;
        }
        match &q.judgment {
            None => true,
            Some(j) => j.judge_model_best_answer.as_deref() != Some(id.model.as_str()),
        }
    }

    pub fn needs_judgment(&self, variant: &VariantResult) -> bool {
        self.enabled()
            && !variant.is_base
            && (self.rejudge || variant.questions.iter().any(|q| self.question_needs_similarity(q)))
    }

    pub fn needs_judge_best(&self, variant: &VariantResult) -> bool {
        self.best_enabled()
            && !variant.is_base
            && (self.rejudge || variant.questions.iter().any(|q| self.question_needs_best(q)))
    }

    fn emit_progress(&self) {
        (self.reporter.on_judge)(JudgeProgress {
            done: self.done.load(Ordering::SeqCst),
            total: self.scheduled.load(Ordering::SeqCst),
        });
    }

    fn report_verdict(&self, tag: &str, question_id: &str, pass: JudgePass, verdict: &Verdict) {
        if !self.verbose {
            return;
        }
        match pass {
            JudgePass::Similarity => self.reporter.message(format!(
                "[judge] {tag}/{question_id}: score {} best {} ({})",
                verdict.score,
                verdict.best_answer.map_or("-", |b| b.as_str()),
                truncate(&verdict.reason, 120),
            )),
            JudgePass::BestAnswer => self.reporter.message(format!(
                "[judge-best] {tag}/{question_id}: best {} ({})",
                verdict.best_answer.map_or("-", |b| b.as_str()),
                truncate(&verdict.reason, 120),
            )),
        }
    }

    /// Build the jobs a pass still needs for one variant, against the
    /// base variant's stored answers.
    pub fn pending_jobs(
        &self,
        doc: &ResultsDocument,
        tag: &str,
        pass: JudgePass,
    ) -> Vec<PairJob> {
        let Some(base) = doc.base_variant() else {
            return Vec::new();
        };
        let base_answers: HashMap<&str, &str> = base
            .questions
            .iter()
            .map(|q| (q.question_id.as_str(), q.answer.as_str()))
            .collect();
        let Some(variant) = doc.variant(tag) else {
            return Vec::new();
        };
        if variant.is_base {
            return Vec::new();
        }
        variant
            .questions
            .iter()
            .filter(|q| match pass {
                JudgePass::Similarity => self.question_needs_similarity(q),
                JudgePass::BestAnswer => self.question_needs_best(q),
            })
            .filter_map(|q| {
                base_answers.get(q.question_id.as_str()).map(|base_answer| PairJob {
                    tag: variant.tag.clone(),
                    question_id: q.question_id.clone(),
                    question: q.prompt.clone(),
                    base_answer: (*base_answer).to_string(),
                    variant_answer: q.answer.clone(),
                    test_ctx: q.ctx_size,
                })
            })
            .collect()
    }

    /// Serial mode: run every similarity judgment for the variant to
    /// completion, then every best-answer judgment, merging in place.
    /// A permanently failed judgment is skipped with a warning rather
    /// than aborting the run.
    pub async fn judge_variant_serial(
        &mut self,
        doc: &mut ResultsDocument,
        tag: &str,
    ) -> Result<(), ClientError> {
        let passes = [
            (JudgePass::Similarity, self.judge.clone()),
            (JudgePass::BestAnswer, self.judge_best.clone()),
        ];
        for (pass, client) in passes {
            let Some(client) = client else { continue };
            let jobs = self.pending_jobs(doc, tag, pass);
            self.scheduled.fetch_add(jobs.len(), Ordering::SeqCst);
            for job in jobs {
                if self.cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }
                let outcome = run_job(&client, pass, &job).await;
                self.done.fetch_add(1, Ordering::SeqCst);
                self.emit_progress();
                match outcome {
                    Ok(verdict) => {
                        self.report_verdict(&job.tag, &job.question_id, pass, &verdict);
                        apply_outcome(
                            doc,
                            JudgeOutcome {
                                tag: job.tag,
                                question_id: job.question_id,
                                pass,
                                verdict,
                                identity: client.identity(),
                            },
                        );
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            tag = %job.tag,
                            question = %job.question_id,
                            error = %e,
                            "judgment failed permanently, skipping"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Parallel mode: one background similarity task per completed
    /// question.
    pub fn spawn_similarity(&mut self, job: PairJob) {
        let Some(client) = self.judge.clone() else { return };
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        {
            let mut pending = self.pending_by_tag.lock().expect("pending lock");
            *pending.entry(job.tag.clone()).or_default() += 1;
        }
        let tx = self.tx.clone();
        let pending = self.pending_by_tag.clone();
        let done = self.done.clone();
        let scheduled = self.scheduled.clone();
        let reporter = self.reporter.clone();
        self.tasks.spawn(async move {
            let outcome = run_job(&client, JudgePass::Similarity, &job).await;
            match outcome {
                Ok(verdict) => {
                    let _ = tx.send(JudgeOutcome {
                        tag: job.tag.clone(),
                        question_id: job.question_id.clone(),
                        pass: JudgePass::Similarity,
                        verdict,
                        identity: client.identity(),
                    });
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!(
                    tag = %job.tag,
                    question = %job.question_id,
                    error = %e,
                    "background judgment failed permanently, skipping"
                ),
            }
            {
                let mut pending = pending.lock().expect("pending lock");
                if let Some(n) = pending.get_mut(&job.tag) {
                    *n = n.saturating_sub(1);
                }
            }
            done.fetch_add(1, Ordering::SeqCst);
            (reporter.on_judge)(JudgeProgress {
                done: done.load(Ordering::SeqCst),
                total: scheduled.load(Ordering::SeqCst),
            });
        });
    }

    /// Parallel mode: best-answer judgments for a variant start only
    /// after its similarity tasks have drained.
    pub fn schedule_best_after_drain(&mut self, tag: &str, jobs: Vec<PairJob>) {
        let Some(client) = self.judge_best.clone() else { return };
        if jobs.is_empty() {
            return;
        }
        self.scheduled.fetch_add(jobs.len(), Ordering::SeqCst);
        let tx = self.tx.clone();
        let pending = self.pending_by_tag.clone();
        let done = self.done.clone();
        let scheduled = self.scheduled.clone();
        let reporter = self.reporter.clone();
        let cancel = self.cancel.clone();
        let tag = tag.to_string();
        self.tasks.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let drained = {
                    let pending = pending.lock().expect("pending lock");
                    pending.get(&tag).copied().unwrap_or(0) == 0
                };
                if drained {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            for job in jobs {
                if cancel.is_cancelled() {
                    return;
                }
                match run_job(&client, JudgePass::BestAnswer, &job).await {
                    Ok(verdict) => {
                        let _ = tx.send(JudgeOutcome {
                            tag: job.tag.clone(),
                            question_id: job.question_id.clone(),
                            pass: JudgePass::BestAnswer,
                            verdict,
                            identity: client.identity(),
                        });
                    }
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => tracing::warn!(
                        tag = %job.tag,
                        question = %job.question_id,
                        error = %e,
                        "best-answer judgment failed permanently, skipping"
                    ),
                }
                done.fetch_add(1, Ordering::SeqCst);
                (reporter.on_judge)(JudgeProgress {
                    done: done.load(Ordering::SeqCst),
                    total: scheduled.load(Ordering::SeqCst),
                });
            }
        });
    }

    /// Merge whatever background verdicts have arrived. Called from the
    /// main control flow only; the document is never touched from tasks.
    pub fn drain_into(&mut self, doc: &mut ResultsDocument) -> usize {
        let mut merged = 0;
        while let Ok(outcome) = self.rx.try_recv() {
            self.report_verdict(&outcome.tag, &outcome.question_id, outcome.pass, &outcome.verdict);
            apply_outcome(doc, outcome);
            merged += 1;
        }
        merged
    }

    /// Join every background task, then merge the remaining verdicts.
    pub async fn join_all(&mut self, doc: &mut ResultsDocument) -> usize {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::warn!(error = %e, "judge task join error");
            }
        }
        self.drain_into(doc)
    }

    pub fn has_background_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }
}

async fn run_job(
    client: &JudgeClient,
    pass: JudgePass,
    job: &PairJob,
) -> Result<Verdict, ClientError> {
    let system = match pass {
        JudgePass::Similarity => SIMILARITY_SYSTEM,
        JudgePass::BestAnswer => BEST_ANSWER_SYSTEM,
    };
    let user = pair_prompt(&job.question, &job.base_answer, &job.variant_answer);
    client
        .judge(system, &user, JUDGE_MAX_TOKENS, job.test_ctx)
        .await
}

/// A judgment is written only against a question result that has already
/// been persisted at least once; missing targets are dropped with a
/// warning.
fn apply_outcome(doc: &mut ResultsDocument, outcome: JudgeOutcome) {
    let Some(variant) = doc.variant_mut(&outcome.tag) else {
        tracing::warn!(tag = %outcome.tag, "verdict for unknown variant dropped");
        return;
    };
    let Some(question) = variant.question_mut(&outcome.question_id) else {
        tracing::warn!(
            tag = %outcome.tag,
            question = %outcome.question_id,
            "verdict for unknown question dropped"
        );
        return;
    };
    match outcome.pass {
        JudgePass::Similarity => {
            question.judgment = Some(Judgment {
                score: outcome.verdict.score,
                reason: outcome.verdict.reason,
                best_answer: outcome.verdict.best_answer,
                best_answer_reason: None,
                judge_model: outcome.identity.model,
                judge_provider: Some(outcome.identity.provider),
                judge_api_version: outcome.identity.api_version,
                judge_model_best_answer: None,
                judged_at: now_rfc3339ish(),
                best_judged_at: None,
                raw_response: outcome.verdict.raw_response,
            });
        }
        JudgePass::BestAnswer => match question.judgment.as_mut() {
            Some(judgment) => {
                judgment.best_answer = outcome.verdict.best_answer;
                judgment.best_answer_reason =
                    Some(outcome.verdict.reason).filter(|r| !r.is_empty());
                judgment.judge_model_best_answer = Some(outcome.identity.model);
                judgment.best_judged_at = Some(now_rfc3339ish());
            }
            None => tracing::warn!(
                tag = %outcome.tag,
                question = %outcome.question_id,
                "best-answer verdict without similarity judgment dropped"
            ),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{JudgeBackend, JudgeClient};
    use crate::model::{BestAnswer, RunOptions, VariantResult};
    use crate::retry::{AutoExtend, CallKernel};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedBackend {
        model: &'static str,
        response: &'static str,
    }

    #[async_trait]
    impl JudgeBackend for FixedBackend {
        async fn complete(
            &self,
            _system: &str,
            _user: &str,
            _max_tokens: u32,
            _test_ctx: u64,
            _cancel: &CancellationToken,
        ) -> Result<String, ClientError> {
            Ok(self.response.to_string())
        }

        fn identity(&self) -> JudgeIdentity {
            JudgeIdentity {
                model: self.model.into(),
                provider: "test".into(),
                api_version: None,
            }
        }
    }

    fn judge_client(model: &'static str, response: &'static str) -> JudgeClient {
        JudgeClient::new(
            Arc::new(FixedBackend { model, response }),
            CallKernel::new(
                CancellationToken::new(),
                Duration::from_secs(5),
                Arc::new(AutoExtend),
            ),
        )
    }

    fn question(id: &str, answer: &str) -> QuestionResult {
        QuestionResult {
            question_id: id.into(),
            category: "c".into(),
            prompt: format!("prompt {id}"),
            answer: answer.into(),
            logprobs: vec![],
            eval_tokens_per_second: 10.0,
            prompt_tokens_per_second: 100.0,
            total_tokens: 4,
            ctx_size: 4096,
            judgment: None,
        }
    }

    fn doc_with_base_and_variant() -> ResultsDocument {
        let mut doc = ResultsDocument::new("default", "m", RunOptions::default());
        let mut base = VariantResult::new("fp16", "m:fp16");
        base.is_base = true;
        base.questions.push(question("q1", "base answer 1"));
        base.questions.push(question("q2", "base answer 2"));
        doc.upsert_variant(base);

        let mut v = VariantResult::new("q4_0", "m:q4_0");
        v.questions.push(question("q1", "variant answer 1"));
        v.questions.push(question("q2", "variant answer 2"));
        doc.upsert_variant(v);
        doc
    }

    fn orchestrator(
        judge: Option<JudgeClient>,
        judge_best: Option<JudgeClient>,
        rejudge: bool,
    ) -> JudgeOrchestrator {
        JudgeOrchestrator::new(
            judge,
            judge_best,
            JudgeMode::Serial,
            false,
            rejudge,
            false,
            Reporter::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn serial_judging_merges_similarity_and_best() {
        let mut doc = doc_with_base_and_variant();
        let mut orch = orchestrator(
            Some(judge_client(
                "judge-a",
                r#"{"score": 80, "bestanswer": "A", "reason": "close"}"#,
            )),
            Some(judge_client(
                "judge-b",
                r#"{"bestanswer": "B", "reason": "variant clearer"}"#,
            )),
            false,
        );

        orch.judge_variant_serial(&mut doc, "q4_0").await.expect("judged");

        let v = doc.variant("q4_0").expect("variant");
        for q in &v.questions {
            let j = q.judgment.as_ref().expect("judgment");
            assert_eq!(j.score, 80);
            assert_eq!(j.judge_model, "judge-a");
            // The best pass overwrote only the marker and its reason.
            assert_eq!(j.best_answer, Some(BestAnswer::B));
            assert_eq!(j.judge_model_best_answer.as_deref(), Some("judge-b"));
            assert!(j.best_judged_at.is_some());
            assert!(!j.judged_at.is_empty());
        }
        // Base stays unjudged.
        assert!(doc
            .variant("fp16")
            .expect("base")
            .questions
            .iter()
            .all(|q| q.judgment.is_none()));
    }

    #[tokio::test]
    async fn same_identity_judgments_are_skipped() {
        let mut doc = doc_with_base_and_variant();
        let judge = judge_client("judge-a", r#"{"score": 70, "bestanswer": "AB", "reason": "r"}"#);
        let mut orch = orchestrator(Some(judge.clone()), None, false);

        orch.judge_variant_serial(&mut doc, "q4_0").await.expect("judged");
        assert!(!orch.needs_judgment(doc.variant("q4_0").expect("variant")));
        assert!(orch.pending_jobs(&doc, "q4_0", JudgePass::Similarity).is_empty());
    }

    #[tokio::test]
    async fn different_identity_counts_as_missing() {
        let mut doc = doc_with_base_and_variant();
        let mut orch = orchestrator(
            Some(judge_client("judge-a", r#"{"score": 70, "bestanswer": "A", "reason": "r"}"#)),
            None,
            false,
        );
        orch.judge_variant_serial(&mut doc, "q4_0").await.expect("judged");

        let orch2 = orchestrator(
            Some(judge_client("judge-z", r#"{"score": 1, "bestanswer": "A", "reason": "r"}"#)),
            None,
            false,
        );
        assert!(orch2.needs_judgment(doc.variant("q4_0").expect("variant")));
        assert_eq!(
            orch2.pending_jobs(&doc, "q4_0", JudgePass::Similarity).len(),
            2
        );
    }

    #[tokio::test]
    async fn parallel_tasks_merge_on_join() {
        let mut doc = doc_with_base_and_variant();
        let mut orch = JudgeOrchestrator::new(
            Some(judge_client(
                "judge-a",
                r#"{"score": 64, "bestanswer": "AB", "reason": "close enough"}"#,
            )),
            None,
            JudgeMode::Parallel,
            false,
            false,
            false,
            Reporter::default(),
            CancellationToken::new(),
        );

        for job in orch.pending_jobs(&doc, "q4_0", JudgePass::Similarity) {
            orch.spawn_similarity(job);
        }
        assert!(orch.has_background_tasks());
        let merged = orch.join_all(&mut doc).await;
        assert_eq!(merged, 2);

        let v = doc.variant("q4_0").expect("variant");
        assert!(v.questions.iter().all(|q| q.judgment.is_some()));
    }

    #[tokio::test]
    async fn best_pass_waits_for_similarity_drain() {
        let mut doc = doc_with_base_and_variant();
        let mut orch = JudgeOrchestrator::new(
            Some(judge_client(
                "judge-a",
                r#"{"score": 50, "bestanswer": "A", "reason": "sim"}"#,
            )),
            Some(judge_client(
                "judge-b",
                r#"{"bestanswer": "AB", "reason": "both fine"}"#,
            )),
            JudgeMode::Parallel,
            false,
            false,
            false,
            Reporter::default(),
            CancellationToken::new(),
        );

        let sim_jobs = orch.pending_jobs(&doc, "q4_0", JudgePass::Similarity);
        let best_jobs = orch.pending_jobs(&doc, "q4_0", JudgePass::BestAnswer);
        for job in sim_jobs {
            orch.spawn_similarity(job);
        }
        orch.schedule_best_after_drain("q4_0", best_jobs);
        orch.join_all(&mut doc).await;

        let v = doc.variant("q4_0").expect("variant");
        for q in &v.questions {
            let j = q.judgment.as_ref().expect("judgment");
            assert_eq!(j.judge_model, "judge-a");
            assert_eq!(j.best_answer, Some(BestAnswer::Ab));
            assert_eq!(j.judge_model_best_answer.as_deref(), Some("judge-b"));
        }
    }

    #[test]
    fn rejudge_forces_all_questions() {
        let doc = doc_with_base_and_variant();
        let orch = orchestrator(
            Some(judge_client("judge-a", "{}")),
            None,
            true,
        );
        assert!(orch.needs_judgment(doc.variant("q4_0").expect("variant")));
        assert_eq!(
            orch.pending_jobs(&doc, "q4_0", JudgePass::Similarity).len(),
            2
        );
    }
}
