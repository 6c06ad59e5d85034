//! Server-backed judge: non-streaming chat against the same inference API
//! the generation side uses, with deterministic options and a structured
//! response contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::client::api::{ChatMessage, SamplerOptions};
use crate::client::InferenceClient;
use crate::errors::ClientError;

use super::{JudgeBackend, JudgeIdentity};

/// Structured response contract the server enforces.
fn verdict_format() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "score": { "type": "integer" },
            "bestanswer": { "type": "string" },
            "reason": { "type": "string" }
        },
        "required": ["score", "bestanswer", "reason"]
    })
}

pub struct LocalJudge {
    client: InferenceClient,
    model: String,
    /// Explicit judge context length; 0 derives `2·testCtx + 2048`.
    judge_ctx: u64,
    seed: i64,
    /// Held while talking to an endpoint shared with generation so judge
    /// and generate calls never overlap on the same server.
    gate: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl LocalJudge {
    pub fn new(
        client: InferenceClient,
        model: String,
        judge_ctx: u64,
        seed: i64,
        gate: Option<Arc<tokio::sync::Mutex<()>>>,
    ) -> Self {
        Self {
            client,
            model,
            judge_ctx,
            seed,
            gate,
        }
    }

    fn resolve_ctx(&self, test_ctx: u64) -> u64 {
        if self.judge_ctx > 0 {
            self.judge_ctx
        } else {
            2 * test_ctx + 2048
        }
    }
}

#[async_trait]
impl JudgeBackend for LocalJudge {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        test_ctx: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let _serialized = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let options = SamplerOptions {
            temperature: 0.0,
            seed: self.seed,
            top_p: 1.0,
            top_k: 1,
            repeat_penalty: 1.0,
            frequency_penalty: 0.0,
            num_ctx: Some(self.resolve_ctx(test_ctx)),
            num_predict: Some(u64::from(max_tokens)),
        };
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: system.into(),
            },
            ChatMessage {
                role: "user".into(),
                content: user.into(),
            },
        ];
        self.client
            .chat(&self.model, messages, Some(verdict_format()), options)
            .await
    }

    fn identity(&self) -> JudgeIdentity {
        JudgeIdentity {
            model: self.model.clone(),
            provider: "local".into(),
            api_version: None,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.model.is_empty() {
            anyhow::bail!("judge model name is empty");
        }
        Ok(())
    }
}
