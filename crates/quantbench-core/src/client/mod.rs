//! HTTP client for the primary inference server.
//!
//! The underlying reqwest client carries no aggregate timeout; every call
//! site wraps requests in its own per-request deadline so the engine can
//! double the budget dynamically without tearing the client down.

pub mod api;

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;
use crate::model::{RunOptions, TokenLogprob};

use api::{
    ChatMessage, ChatRequest, ChatResponse, DeleteRequest, GenerateRequest, GenerateResponse,
    ListedModel, PsResponse, PullRequest, PullStatusRecord, SamplerOptions, ShowRequest,
    ShowResponse, TagsResponse, TensorDescriptor, VersionResponse,
};

/// Everything the runner needs from one generate call.
#[derive(Debug)]
pub struct GenerateOutcome {
    pub answer: String,
    pub logprobs: Vec<TokenLogprob>,
    pub eval_count: u64,
    pub eval_duration_ns: u64,
    pub prompt_eval_count: u64,
    pub prompt_eval_duration_ns: u64,
}

#[derive(Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    base: String,
}

impl InferenceClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn check<T: serde::de::DeserializeOwned>(
        resp: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T, ClientError> {
        let resp = resp.map_err(ClientError::from_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let reset = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body, reset));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ClientError::Network(format!("invalid server response: {e}")))
    }

    /// Server semantic version, or `Network` when unreachable.
    pub async fn version(&self) -> Result<String, ClientError> {
        let v: VersionResponse =
            Self::check(self.http.get(self.url("/api/version")).send().await).await?;
        Ok(v.version)
    }

    pub async fn list(&self) -> Result<Vec<ListedModel>, ClientError> {
        let tags: TagsResponse =
            Self::check(self.http.get(self.url("/api/tags")).send().await).await?;
        Ok(tags.models)
    }

    pub async fn show(&self, model: &str, verbose: bool) -> Result<ShowResponse, ClientError> {
        Self::check(
            self.http
                .post(self.url("/api/show"))
                .json(&ShowRequest { model, verbose })
                .send()
                .await,
        )
        .await
    }

    /// Full-answer generation with log-probability capture. Streaming is
    /// always off; determinism comes from the fixed run options plus the
    /// resolved context length and nothing else.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &RunOptions,
        num_ctx: u64,
        num_predict: u64,
    ) -> Result<GenerateOutcome, ClientError> {
        let req = GenerateRequest {
            model,
            prompt,
            stream: false,
            logprobs: true,
            options: Some(SamplerOptions::from_run_options(
                options,
                Some(num_ctx),
                Some(num_predict),
            )),
            think: think_value(options),
            keep_alive: None,
        };
        let resp: GenerateResponse = Self::check(
            self.http
                .post(self.url("/api/generate"))
                .json(&req)
                .send()
                .await,
        )
        .await?;
        if resp.logprobs.is_empty() {
            return Err(ClientError::LogprobsUnavailable);
        }
        Ok(GenerateOutcome {
            answer: resp.response,
            logprobs: resp.logprobs,
            eval_count: resp.eval_count,
            eval_duration_ns: resp.eval_duration,
            prompt_eval_count: resp.prompt_eval_count,
            prompt_eval_duration_ns: resp.prompt_eval_duration,
        })
    }

    /// Minimal chat round used only to force a proper first load; the
    /// generate path assumes an engine initialized for logprob extraction.
    pub async fn chat_load(&self, model: &str, num_ctx: u64) -> Result<(), ClientError> {
        let req = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "hi".into(),
            }],
            stream: false,
            format: None,
            options: Some(SamplerOptions {
                temperature: 0.0,
                seed: 0,
                top_p: 1.0,
                top_k: 1,
                repeat_penalty: 1.0,
                frequency_penalty: 0.0,
                num_ctx: Some(num_ctx),
                num_predict: Some(1),
            }),
            keep_alive: None,
        };
        let _: ChatResponse = Self::check(
            self.http
                .post(self.url("/api/chat"))
                .json(&req)
                .send()
                .await,
        )
        .await?;
        Ok(())
    }

    /// Non-streaming chat used by the local judge back-end.
    pub async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        format: Option<serde_json::Value>,
        options: SamplerOptions,
    ) -> Result<String, ClientError> {
        let req = ChatRequest {
            model,
            messages,
            stream: false,
            format,
            options: Some(options),
            keep_alive: None,
        };
        let resp: ChatResponse = Self::check(
            self.http
                .post(self.url("/api/chat"))
                .json(&req)
                .send()
                .await,
        )
        .await?;
        Ok(resp.message.map(|m| m.content).unwrap_or_default())
    }

    /// Cheap no-op generate that only refreshes the server-side keep-alive
    /// timer for an already-loaded model.
    pub async fn preload_keep_alive(
        &self,
        model: &str,
        keep_alive: &str,
    ) -> Result<(), ClientError> {
        let req = GenerateRequest {
            model,
            prompt: "",
            stream: false,
            logprobs: false,
            options: None,
            think: None,
            keep_alive: Some(keep_alive),
        };
        let _: GenerateResponse = Self::check(
            self.http
                .post(self.url("/api/generate"))
                .json(&req)
                .send()
                .await,
        )
        .await?;
        Ok(())
    }

    /// Ask the server to drop a model from memory.
    pub async fn unload(&self, model: &str) -> Result<(), ClientError> {
        self.preload_keep_alive(model, "0").await
    }

    /// Streamed pull. Records are decoded as they arrive and handed to
    /// `on_status`; the body is never buffered whole.
    pub async fn pull<F>(
        &self,
        model: &str,
        cancel: &CancellationToken,
        mut on_status: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&PullStatusRecord),
    {
        let resp = self
            .http
            .post(self.url("/api/pull"))
            .json(&PullRequest { model, stream: true })
            .send()
            .await
            .map_err(ClientError::from_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let reset = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body, reset));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buf.find('\n') {
                        let line: String = buf.drain(..=pos).collect();
                        handle_pull_line(line.trim(), &mut on_status)?;
                    }
                }
                Some(Err(e)) => return Err(ClientError::from_transport(e)),
                None => break,
            }
        }
        if !buf.trim().is_empty() {
            handle_pull_line(buf.trim(), &mut on_status)?;
        }
        Ok(())
    }

    /// Idempotent delete; a missing model counts as success.
    pub async fn delete(&self, model: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(self.url("/api/delete"))
            .json(&DeleteRequest { model })
            .send()
            .await
            .map_err(ClientError::from_transport)?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::from_status(status.as_u16(), body, None))
    }

    /// Names of the models the server currently holds in memory.
    pub async fn ps_loaded(&self) -> Result<Vec<String>, ClientError> {
        let ps: PsResponse = Self::check(self.http.get(self.url("/api/ps")).send().await).await?;
        Ok(ps.models.into_iter().map(|m| m.name).collect())
    }
}

fn handle_pull_line<F>(line: &str, on_status: &mut F) -> Result<(), ClientError>
where
    F: FnMut(&PullStatusRecord),
{
    if line.is_empty() {
        return Ok(());
    }
    let record: PullStatusRecord = serde_json::from_str(line)
        .map_err(|e| ClientError::Network(format!("invalid pull record: {e}")))?;
    if let Some(err) = &record.error {
        let lower = err.to_lowercase();
        if lower.contains("not found") || lower.contains("does not exist") {
            return Err(ClientError::NotFound(err.clone()));
        }
        return Err(ClientError::Network(err.clone()));
    }
    on_status(&record);
    Ok(())
}

fn think_value(options: &RunOptions) -> Option<serde_json::Value> {
    match (&options.think_level, options.think) {
        (Some(level), _) => Some(serde_json::Value::String(level.clone())),
        (None, true) => Some(serde_json::Value::Bool(true)),
        (None, false) => None,
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Derive the enhanced quantization label from per-tensor descriptors:
/// the dominant tensor dtype plus the runner-up when the model is mixed.
pub fn enhanced_quantization(tensors: &[TensorDescriptor]) -> Option<String> {
    if tensors.is_empty() {
        return None;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in tensors {
        *counts.entry(t.dtype.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let total = tensors.len();
    let (top, top_n) = ranked[0];
    if ranked.len() == 1 {
        return Some(top.to_string());
    }
    let (second, second_n) = ranked[1];
    Some(format!(
        "{} ({}%) / {} ({}%)",
        top,
        top_n * 100 / total,
        second,
        second_n * 100 / total
    ))
}
