//! Top-level controller: validate → load or create the results document →
//! verify endpoints → expand tags → verify models → base decision →
//! variant loop → judgment catch-up → background join → cleanup. Every
//! edge out of the happy path saves whatever state exists before
//! returning.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::cancel::CancelController;
use crate::client::{enhanced_quantization, InferenceClient};
use crate::errors::ClientError;
use crate::judge::cloud::{CloudJudge, JudgeSpec};
use crate::judge::local::LocalJudge;
use crate::judge::orchestrator::{JudgeMode, JudgeOrchestrator, JudgePass};
use crate::judge::JudgeClient;
use crate::lifecycle::ModelLifecycle;
use crate::model::{
    looks_like_base_tag, same_model, split_registry_path, tag_token, ModelMetadata,
    ResultsDocument, RunOptions, VariantResult,
};
use crate::progress::Reporter;
use crate::registry::RegistryClient;
use crate::resolver::TagResolver;
use crate::retry::{CallKernel, RetryPolicy, TimeoutArbiter};
use crate::runner::TestRunner;
use crate::store::ResultsStore;
use crate::suite::TestSuite;

const KEEP_ALIVE: &str = "10m";

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_CANCELLED: i32 = 2;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    pub quants: Vec<String>,
    pub base_tag: Option<String>,
    pub suite: TestSuite,
    pub options: RunOptions,
    pub judge: Option<String>,
    pub judge_best: Option<String>,
    pub judge_mode: JudgeMode,
    pub judge_ctx: u64,
    pub request_timeout: Duration,
    pub force: bool,
    pub rejudge: bool,
    pub on_demand: bool,
    pub no_unload_all: bool,
    pub verbose: bool,
    pub output: Option<PathBuf>,
    pub endpoint: String,
    pub repository_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VariantSummary {
    pub tag: String,
    pub is_base: bool,
    pub questions: usize,
    pub mean_score: Option<f64>,
    pub mean_eval_tps: f64,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub document_path: PathBuf,
    pub variants: Vec<VariantSummary>,
}

#[derive(Debug)]
pub struct EngineExit {
    pub code: i32,
    pub summary: Option<RunSummary>,
}

pub struct QcEngine {
    cfg: EngineConfig,
    cancel: CancelController,
    kernel: CallKernel,
    client: Arc<InferenceClient>,
    registry: Arc<RegistryClient>,
    lifecycle: ModelLifecycle,
    store: ResultsStore,
    reporter: Reporter,
    server_gate: Arc<tokio::sync::Mutex<()>>,
}

impl QcEngine {
    pub fn new(
        cfg: EngineConfig,
        cancel: CancelController,
        arbiter: Arc<dyn TimeoutArbiter>,
        reporter: Reporter,
    ) -> anyhow::Result<Self> {
        let kernel = CallKernel::new(cancel.token(), cfg.request_timeout, arbiter);
        let client = Arc::new(InferenceClient::new(&cfg.endpoint)?);
        let registry_token = ["HF_TOKEN", "HUGGINGFACE_TOKEN"]
            .iter()
            .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()));
        let registry = Arc::new(RegistryClient::new(registry_token)?);
        let lifecycle = ModelLifecycle::new(
            client.clone(),
            registry.clone(),
            kernel.clone(),
            reporter.clone(),
            cfg.no_unload_all,
        );
        let store = ResultsStore::new(ResultsStore::derive_path(&cfg.model, cfg.output.as_deref()));
        Ok(Self {
            cfg,
            cancel,
            kernel,
            client,
            registry,
            lifecycle,
            store,
            reporter,
            server_gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }

    /// Run to completion. 0 = success, 1 = hard failure, 2 = cancelled
    /// with partial results preserved. The document on disk parses as a
    /// whole on every exit path.
    pub async fn run(&self) -> EngineExit {
        let mut orchestrator = match self.validate() {
            Ok(o) => o,
            Err(e) => {
                self.reporter.message(format!("configuration error: {e:#}"));
                return EngineExit {
                    code: EXIT_ERROR,
                    summary: None,
                };
            }
        };

        let mut doc = match self.open_document().await {
            Ok(doc) => doc,
            Err(e) => {
                self.reporter.message(format!("cannot open results: {e:#}"));
                return EngineExit {
                    code: EXIT_ERROR,
                    summary: None,
                };
            }
        };

        match self.run_states(&mut doc, &mut orchestrator).await {
            Ok(()) => {
                let summary = self.summarize(&doc);
                EngineExit {
                    code: EXIT_SUCCESS,
                    summary: Some(summary),
                }
            }
            Err(e) => {
                // Background verdicts and the in-progress variant are
                // already merged into `doc`; keep them.
                orchestrator.drain_into(&mut doc);
                if let Err(save_err) = self.store.save(&doc).await {
                    tracing::error!(error = ?save_err, "failed to save partial results");
                }
                if self.cancel.is_cancelled() || is_cancel(&e) {
                    self.reporter
                        .message("cancelled; partial results were saved");
                    EngineExit {
                        code: EXIT_CANCELLED,
                        summary: Some(self.summarize(&doc)),
                    }
                } else {
                    tracing::error!(error = ?e, "run failed");
                    self.reporter
                        .message(format!("error: {e:#} (partial results were saved)"));
                    EngineExit {
                        code: EXIT_ERROR,
                        summary: None,
                    }
                }
            }
        }
    }

    fn validate(&self) -> anyhow::Result<JudgeOrchestrator> {
        anyhow::ensure!(!self.cfg.model.trim().is_empty(), "a target model is required");
        anyhow::ensure!(
            !self.cfg.quants.is_empty(),
            "at least one variant specifier is required"
        );

        let judge = self
            .cfg
            .judge
            .as_deref()
            .map(|raw| self.build_judge(raw))
            .transpose()?;
        let judge_best = self
            .cfg
            .judge_best
            .as_deref()
            .map(|raw| self.build_judge(raw))
            .transpose()?;
        for client in judge.iter().chain(judge_best.iter()) {
            client.validate()?;
        }

        Ok(JudgeOrchestrator::new(
            judge,
            judge_best,
            self.cfg.judge_mode,
            self.cfg.force,
            self.cfg.rejudge,
            self.cfg.verbose,
            self.reporter.clone(),
            self.cancel.token(),
        ))
    }

    fn build_judge(&self, raw: &str) -> anyhow::Result<JudgeClient> {
        match JudgeSpec::parse(raw)? {
            JudgeSpec::Local { model, endpoint } => {
                let same_endpoint = endpoint
                    .as_deref()
                    .map(|ep| ep.trim_end_matches('/') == self.cfg.endpoint.trim_end_matches('/'))
                    .unwrap_or(true);
                let (client, gate) = if same_endpoint {
                    (self.client.as_ref().clone(), Some(self.server_gate.clone()))
                } else {
                    (
                        InferenceClient::new(endpoint.as_deref().expect("separate endpoint"))?,
                        None,
                    )
                };
                Ok(JudgeClient::new(
                    Arc::new(LocalJudge::new(
                        client,
                        model,
                        self.cfg.judge_ctx,
                        self.cfg.options.seed,
                        gate,
                    )),
                    self.kernel.clone(),
                ))
            }
            JudgeSpec::Cloud {
                provider,
                key,
                model,
                endpoint,
            } => Ok(JudgeClient::new(
                Arc::new(CloudJudge::from_spec(provider, key, model, endpoint)?),
                self.kernel.clone(),
            )),
        }
    }

    async fn open_document(&self) -> anyhow::Result<ResultsDocument> {
        let (mut doc, created) = self
            .store
            .open_or_create(&self.cfg.suite.name, &self.cfg.model, &self.cfg.options)
            .await?;
        if !created && doc.options != self.cfg.options {
            if self.cfg.force {
                tracing::warn!("run options changed; --force discards all stored results");
                doc.options = self.cfg.options.clone();
                doc.variants.clear();
            } else {
                anyhow::bail!(
                    "run options differ from the stored document {}; re-run with --force to start over",
                    self.store.path().display()
                );
            }
        }
        Ok(doc)
    }

    async fn run_states(
        &self,
        doc: &mut ResultsDocument,
        orchestrator: &mut JudgeOrchestrator,
    ) -> anyhow::Result<()> {
        // VERIFY_ENDPOINTS
        let version = self
            .kernel
            .call("version", RetryPolicy::normal(), || self.client.version())
            .await
            .with_context(|| {
                format!("inference server at {} is unreachable", self.cfg.endpoint)
            })?;
        self.reporter
            .message(format!("server version {version} at {}", self.cfg.endpoint));
        doc.server_version = version;
        doc.engine_version = env!("CARGO_PKG_VERSION").to_string();
        if self.cfg.repository_url.is_some() {
            doc.repository_url = self.cfg.repository_url.clone();
        }

        // EXPAND_TAGS
        let resolver = TagResolver::new(&self.client, &self.registry);
        let mut refs = resolver
            .expand(&self.cfg.model, &self.cfg.quants)
            .await
            .context("failed to expand variant specifiers")?;
        anyhow::ensure!(!refs.is_empty(), "no variants matched the given specifiers");

        // BASE_DECISION
        let base_tag = self
            .cfg
            .base_tag
            .clone()
            .or_else(|| doc.base_variant().map(|v| v.tag.clone()))
            .or_else(|| {
                refs.iter()
                    .map(|r| tag_token(r))
                    .find(|t| looks_like_base_tag(t))
            });
        if let Some(base) = &base_tag {
            // The base is tested before any non-base variant.
            match refs
                .iter()
                .position(|r| tag_token(r).eq_ignore_ascii_case(base))
            {
                Some(pos) => {
                    let base_ref = refs.remove(pos);
                    refs.insert(0, base_ref);
                }
                None => {
                    let family = self.cfg.model.split(':').next().unwrap_or(&self.cfg.model);
                    let base_ref = if base.contains('/') {
                        base.clone()
                    } else {
                        format!("{family}:{base}")
                    };
                    refs.insert(0, base_ref);
                }
            }
        } else if orchestrator.enabled() {
            self.reporter
                .message("no base variant could be determined; judging will be skipped");
        }
        doc.repair_base_election(base_tag.as_deref());

        // VERIFY_MODELS
        let listed = self
            .kernel
            .call("tags", RetryPolicy::normal(), || self.client.list())
            .await?;
        let mut to_pull: HashSet<String> = HashSet::new();
        for model_ref in &refs {
            if listed.iter().any(|m| same_model(&m.name, model_ref)) {
                continue;
            }
            let tag = tag_token(model_ref);
            let complete = doc
                .variant(&tag)
                .map(|v| v.is_complete(&self.cfg.suite))
                .unwrap_or(false);
            if complete && !self.cfg.force {
                continue;
            }
            if self.cfg.on_demand {
                to_pull.insert(model_ref.clone());
            } else {
                anyhow::bail!(
                    "model '{model_ref}' is not available on the server (re-run with --ondemand to pull it)"
                );
            }
        }

        // VARIANT_LOOP
        let mut catch_up: Vec<String> = Vec::new();
        for model_ref in refs.clone() {
            self.check_cancel()?;
            let tag = tag_token(&model_ref);

            let complete = doc
                .variant(&tag)
                .map(|v| v.is_complete(&self.cfg.suite))
                .unwrap_or(false);
            if complete && !self.cfg.force {
                let variant = doc.variant(&tag).expect("complete variant");
                if orchestrator.needs_judgment(variant) || orchestrator.needs_judge_best(variant) {
                    catch_up.push(tag.clone());
                }
                continue;
            }
            if self.cfg.force {
                if let Some(v) = doc.variant_mut(&tag) {
                    v.questions.clear();
                }
            }

            let mut actual_ref = model_ref.clone();
            if to_pull.contains(&model_ref) {
                self.reporter.message(format!("pulling {model_ref}"));
                self.lifecycle
                    .pull_on_demand(&model_ref)
                    .await
                    .with_context(|| format!("failed to pull '{model_ref}'"))?;
                actual_ref = self.lifecycle.resolve_stored_name(&model_ref).await?;
                if doc.variant(&tag).is_none() {
                    doc.upsert_variant(VariantResult::new(&tag, &actual_ref));
                }
                doc.variant_mut(&tag).expect("variant just ensured").pulled_on_demand = true;
                self.store.save(doc).await?;
            }

            self.lifecycle
                .prepare(&actual_ref, self.cfg.suite.ctx_size, KEEP_ALIVE)
                .await
                .with_context(|| format!("failed to load '{actual_ref}'"))?;

            let metadata = self.collect_metadata(&actual_ref).await;
            if doc.variant(&tag).is_none() {
                doc.upsert_variant(VariantResult::new(&tag, &actual_ref));
            }
            {
                let variant = doc.variant_mut(&tag).expect("variant just ensured");
                variant.model_name = actual_ref.clone();
                variant.metadata = metadata;
                variant.is_base = base_tag
                    .as_deref()
                    .map(|b| b.eq_ignore_ascii_case(&tag))
                    .unwrap_or(false);
            }

            let base_answers: Option<HashMap<String, String>> =
                if orchestrator.mode == JudgeMode::Parallel && orchestrator.enabled() {
                    doc.base_variant()
                        .filter(|b| !b.tag.eq_ignore_ascii_case(&tag))
                        .map(|b| {
                            b.questions
                                .iter()
                                .map(|q| (q.question_id.clone(), q.answer.clone()))
                                .collect()
                        })
                } else {
                    None
                };

            let runner = TestRunner {
                generator: self.client.as_ref(),
                kernel: &self.kernel,
                suite: &self.cfg.suite,
                options: &self.cfg.options,
                reporter: &self.reporter,
                server_gate: &self.server_gate,
            };
            runner
                .run_variant(doc, &tag, &actual_ref, orchestrator, base_answers.as_ref())
                .await
                .with_context(|| format!("testing '{actual_ref}' failed"))?;

            self.store.save(doc).await?;

            match orchestrator.mode {
                JudgeMode::Serial => {
                    let variant = doc.variant(&tag).expect("variant exists");
                    if orchestrator.needs_judgment(variant)
                        || orchestrator.needs_judge_best(variant)
                    {
                        orchestrator.judge_variant_serial(doc, &tag).await?;
                        self.store.save(doc).await?;
                        if let Err(e) = self.lifecycle.refresh_keep_alive(&actual_ref, KEEP_ALIVE).await
                        {
                            tracing::debug!(error = %e, "keep-alive refresh failed");
                        }
                    }
                }
                JudgeMode::Parallel => {
                    orchestrator.drain_into(doc);
                    let best_jobs = orchestrator.pending_jobs(doc, &tag, JudgePass::BestAnswer);
                    orchestrator.schedule_best_after_drain(&tag, best_jobs);
                    self.store.save(doc).await?;
                }
            }
        }

        // JUDGMENT_CATCHUP
        for tag in catch_up {
            self.check_cancel()?;
            orchestrator.judge_variant_serial(doc, &tag).await?;
            self.store.save(doc).await?;
        }

        // BACKGROUND_JOIN
        if orchestrator.has_background_tasks() {
            self.reporter.message("waiting for background judgments");
        }
        let merged = orchestrator.join_all(doc).await;
        if merged > 0 {
            self.store.save(doc).await?;
        }

        // CLEANUP
        if let Err(e) = self
            .store
            .backfill_digests(doc, &self.client, &self.registry, &self.kernel)
            .await
        {
            tracing::warn!(error = %e, "digest backfill failed");
        }
        for i in 0..doc.variants.len() {
            let (pulled, variant_complete, name) = {
                let v = &doc.variants[i];
                (
                    v.pulled_on_demand,
                    v.is_complete(&self.cfg.suite),
                    v.model_name.clone(),
                )
            };
            if pulled && variant_complete {
                self.reporter
                    .message(format!("deleting on-demand model {name}"));
                match self.lifecycle.delete(&name).await {
                    Ok(()) => doc.variants[i].pulled_on_demand = false,
                    Err(e) => {
                        tracing::warn!(model = %name, error = %e, "failed to delete on-demand model")
                    }
                }
            }
        }
        self.store.save(doc).await?;
        Ok(())
    }

    async fn collect_metadata(&self, model: &str) -> ModelMetadata {
        let mut meta = ModelMetadata::default();
        if let Ok(listed) = self
            .kernel
            .call("tags", RetryPolicy::normal(), || self.client.list())
            .await
        {
            if let Some(m) = listed.iter().find(|m| same_model(&m.name, model)) {
                meta.size_bytes = m.size;
                meta.digest = m.digest.clone();
                if let Some(d) = &m.details {
                    meta.family = d.family.clone();
                    meta.parameter_size = d.parameter_size.clone();
                    meta.quantization = d.quantization_level.clone();
                }
            }
        }
        match self
            .kernel
            .call("show", RetryPolicy::normal(), || self.client.show(model, true))
            .await
        {
            Ok(show) => {
                if let Some(d) = show.details {
                    if !d.family.is_empty() {
                        meta.family = d.family;
                    }
                    if !d.parameter_size.is_empty() {
                        meta.parameter_size = d.parameter_size;
                    }
                    if !d.quantization_level.is_empty() {
                        meta.quantization = d.quantization_level;
                    }
                }
                if let Some(tensors) = show.tensors {
                    meta.enhanced_quantization = enhanced_quantization(&tensors);
                }
            }
            Err(e) => tracing::warn!(model, error = %e, "model show failed"),
        }
        if meta.digest.is_empty() {
            if let Some((host, repo, Some(tag))) = split_registry_path(model) {
                match self.registry.manifest_digest(&host, &repo, &tag).await {
                    Ok(digest) => meta.digest = digest,
                    Err(e) => tracing::debug!(model, error = %e, "manifest digest unavailable"),
                }
            }
        }
        meta
    }

    fn check_cancel(&self) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            Err(ClientError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn summarize(&self, doc: &ResultsDocument) -> RunSummary {
        RunSummary {
            document_path: self.store.path().to_path_buf(),
            variants: doc
                .variants
                .iter()
                .map(|v| {
                    let scores: Vec<i64> = v
                        .questions
                        .iter()
                        .filter_map(|q| q.judgment.as_ref().map(|j| j.score))
                        .collect();
                    let tps: Vec<f64> = v
                        .questions
                        .iter()
                        .map(|q| q.eval_tokens_per_second)
                        .collect();
                    VariantSummary {
                        tag: v.tag.clone(),
                        is_base: v.is_base,
                        questions: v.questions.len(),
                        mean_score: (!scores.is_empty())
                            .then(|| scores.iter().sum::<i64>() as f64 / scores.len() as f64),
                        mean_eval_tps: if tps.is_empty() {
                            0.0
                        } else {
                            tps.iter().sum::<f64>() / tps.len() as f64
                        },
                    }
                })
                .collect(),
        }
    }
}

fn is_cancel(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ClientError>()
        .map(ClientError::is_cancelled)
        .unwrap_or(false)
}
