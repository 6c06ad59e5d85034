//! Wire types for the inference server's HTTP/JSON API.

use serde::{Deserialize, Serialize};

use crate::model::{RunOptions, TokenLogprob};

#[derive(Debug, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListedModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ListedModel>,
}

#[derive(Debug, Serialize)]
pub struct ShowRequest<'a> {
    pub model: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: String,
    #[serde(default)]
    pub shape: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ShowResponse {
    #[serde(default)]
    pub details: Option<ModelDetails>,
    #[serde(default)]
    pub tensors: Option<Vec<TensorDescriptor>>,
}

/// Sampler options forwarded on every generate/chat call. Field names
/// follow the server's option vocabulary.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerOptions {
    pub temperature: f64,
    pub seed: i64,
    pub top_p: f64,
    pub top_k: i64,
    pub repeat_penalty: f64,
    pub frequency_penalty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u64>,
}

impl SamplerOptions {
    pub fn from_run_options(opts: &RunOptions, num_ctx: Option<u64>, num_predict: Option<u64>) -> Self {
        Self {
            temperature: opts.temperature,
            seed: opts.seed,
            top_p: opts.top_p,
            top_k: opts.top_k,
            repeat_penalty: opts.repeat_penalty,
            frequency_penalty: opts.frequency_penalty,
            num_ctx,
            num_predict,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub logprobs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<SamplerOptions>,
    /// Boolean flag or opaque level string, forwarded verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub logprobs: Vec<TokenLogprob>,
    #[serde(default)]
    pub eval_count: u64,
    /// Nanoseconds.
    #[serde(default)]
    pub eval_duration: u64,
    #[serde(default)]
    pub prompt_eval_count: u64,
    #[serde(default)]
    pub prompt_eval_duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<SamplerOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub message: Option<ChatMessage>,
}

#[derive(Debug, Serialize)]
pub struct PullRequest<'a> {
    pub model: &'a str,
    pub stream: bool,
}

/// One NDJSON record of a streamed pull.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullStatusRecord {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteRequest<'a> {
    pub model: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct PsModel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PsResponse {
    #[serde(default)]
    pub models: Vec<PsModel>,
}
