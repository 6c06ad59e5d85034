//! Persisted results document. UTF-8 JSON with stable camelCase field
//! names; timestamps are RFC3339 UTC. The document is the sole source of
//! truth for resume and downstream rendering.

use serde::{Deserialize, Serialize};

use crate::model::{looks_like_base_tag, RunOptions};
use crate::suite::TestSuite;

pub(crate) fn now_rfc3339ish() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// One per-token confidence entry from the generation trace. Raw byte
/// payloads from older servers are never persisted; unknown fields are
/// dropped on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BestAnswer {
    A,
    B,
    #[serde(rename = "AB")]
    Ab,
}

impl BestAnswer {
    pub fn as_str(&self) -> &'static str {
        match self {
            BestAnswer::A => "A",
            BestAnswer::B => "B",
            BestAnswer::Ab => "AB",
        }
    }
}

/// Verdict attached to a question result. `judge_model` identifies the
/// similarity judge; a best-answer pass may run under a different identity
/// recorded separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Judgment {
    pub score: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_answer: Option<BestAnswer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_answer_reason: Option<String>,
    pub judge_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_model_best_answer: Option<String>,
    pub judged_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_judged_at: Option<String>,
    /// Raw judge output, kept only when no reason could be extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub question_id: String,
    pub category: String,
    pub prompt: String,
    pub answer: String,
    #[serde(default)]
    pub logprobs: Vec<TokenLogprob>,
    pub eval_tokens_per_second: f64,
    pub prompt_tokens_per_second: f64,
    pub total_tokens: u64,
    pub ctx_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgment: Option<Judgment>,
}

/// Descriptive metadata captured from the server when a variant is tested.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_quantization: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub digest: String,
}

impl ModelMetadata {
    /// 12-character short digest form, without the algorithm prefix.
    pub fn short_digest(&self) -> String {
        let raw = self.digest.strip_prefix("sha256:").unwrap_or(&self.digest);
        raw.chars().take(12).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantResult {
    pub tag: String,
    pub model_name: String,
    #[serde(flatten)]
    pub metadata: ModelMetadata,
    #[serde(default)]
    pub is_base: bool,
    /// True from the moment of a successful on-demand pull until the model
    /// is deleted or the document is saved with the flag cleared.
    #[serde(default)]
    pub pulled_on_demand: bool,
    #[serde(default)]
    pub questions: Vec<QuestionResult>,
}

impl VariantResult {
    pub fn new(tag: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            model_name: model_name.into(),
            metadata: ModelMetadata::default(),
            is_base: false,
            pulled_on_demand: false,
            questions: Vec::new(),
        }
    }

    /// Complete iff every suite question has an answer recorded.
    pub fn is_complete(&self, suite: &TestSuite) -> bool {
        self.questions.len() >= suite.total_questions()
    }

    pub fn question(&self, question_id: &str) -> Option<&QuestionResult> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }

    pub fn question_mut(&mut self, question_id: &str) -> Option<&mut QuestionResult> {
        self.questions
            .iter_mut()
            .find(|q| q.question_id == question_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsDocument {
    pub test_suite: String,
    pub model_name: String,
    pub options: RunOptions,
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub engine_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub variants: Vec<VariantResult>,
}

impl ResultsDocument {
    pub fn new(test_suite: impl Into<String>, model_name: impl Into<String>, options: RunOptions) -> Self {
        Self {
            test_suite: test_suite.into(),
            model_name: model_name.into(),
            options,
            server_version: String::new(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            repository_url: None,
            variants: Vec::new(),
        }
    }

    /// Tag lookup is case-insensitive: the tag key must stay stable across
    /// whatever casing the server normalizes a pulled model to.
    pub fn variant(&self, tag: &str) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.tag.eq_ignore_ascii_case(tag))
    }

    pub fn variant_mut(&mut self, tag: &str) -> Option<&mut VariantResult> {
        self.variants
            .iter_mut()
            .find(|v| v.tag.eq_ignore_ascii_case(tag))
    }

    /// Replace a stored variant as a whole, or append in completion order.
    pub fn upsert_variant(&mut self, variant: VariantResult) {
        if let Some(existing) = self
            .variants
            .iter_mut()
            .find(|v| v.tag.eq_ignore_ascii_case(&variant.tag))
        {
            *existing = variant;
        } else {
            self.variants.push(variant);
        }
    }

    pub fn base_variant(&self) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.is_base)
    }

    /// Enforce the at-most-one-base invariant. When no variant is marked
    /// after load, elect the configured base tag, falling back to
    /// well-known half-precision tag patterns.
    pub fn repair_base_election(&mut self, configured_base: Option<&str>) {
        let mut seen = false;
        for v in &mut self.variants {
            if v.is_base {
                if seen {
                    v.is_base = false;
                } else {
                    seen = true;
                }
            }
        }
        if seen {
            return;
        }
        if let Some(base) = configured_base {
            if let Some(v) = self.variant_mut(base) {
                v.is_base = true;
                return;
            }
        }
        if let Some(v) = self
            .variants
            .iter_mut()
            .find(|v| looks_like_base_tag(&v.tag))
        {
            v.is_base = true;
        }
    }
}
