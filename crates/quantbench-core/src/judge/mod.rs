//! Judge clients: one unified "judge one pair" operation over a local
//! server back-end or one of the cloud providers. All back-ends share the
//! response-normalization pipeline and the judge-extended retry policy.

pub mod cloud;
pub mod local;
pub mod normalize;
pub mod orchestrator;
pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;
use crate::model::BestAnswer;
use crate::retry::{CallKernel, RetryPolicy};

/// Ample prediction budget for a verdict.
pub const JUDGE_MAX_TOKENS: u32 = 2048;

const REASON_RETRY_ATTEMPTS: u32 = 5;
const REASON_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Verdict {
    pub score: i64,
    pub best_answer: Option<BestAnswer>,
    pub reason: String,
    /// Raw judge output, only populated when no reason survived parsing.
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeIdentity {
    pub model: String,
    pub provider: String,
    pub api_version: Option<String>,
}

/// Capability set a judge back-end must provide. Each back-end is its own
/// variant; no hierarchies.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    /// One raw completion for a judging prompt. `test_ctx` is the context
    /// length of the question under comparison; local back-ends derive
    /// their window from it.
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        test_ctx: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError>;

    fn identity(&self) -> JudgeIdentity;

    /// Cheap configuration check run before any work starts.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A back-end plus the shared normalization and retry behavior.
#[derive(Clone)]
pub struct JudgeClient {
    backend: Arc<dyn JudgeBackend>,
    kernel: CallKernel,
}

impl JudgeClient {
    pub fn new(backend: Arc<dyn JudgeBackend>, kernel: CallKernel) -> Self {
        Self { backend, kernel }
    }

    pub fn identity(&self) -> JudgeIdentity {
        self.backend.identity()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.backend.validate()
    }

    /// Judge one pair. When the normalized response carries no reason the
    /// whole call is retried a few times with a short delay; after
    /// exhaustion the score and marker are kept and the raw response is
    /// attached for diagnostics.
    pub async fn judge(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        test_ctx: u64,
    ) -> Result<Verdict, ClientError> {
        let cancel = self.kernel.cancel_token();
        let mut last: Option<(String, normalize::ParsedResponse)> = None;

        for attempt in 1..=REASON_RETRY_ATTEMPTS {
            let raw = self
                .kernel
                .call("judge", RetryPolicy::judge_extended(), || {
                    self.backend
                        .complete(system, user, max_tokens, test_ctx, &cancel)
                })
                .await?;
            let parsed = normalize::parse_judge_response(&raw);
            if let Some(reason) = parsed.reason.clone() {
                return Ok(Verdict {
                    score: parsed.score,
                    best_answer: parsed.best_answer,
                    reason,
                    raw_response: None,
                });
            }
            tracing::warn!(
                attempt,
                judge = %self.backend.identity().model,
                "judge response carried no reason, retrying call"
            );
            last = Some((raw, parsed));
            if attempt < REASON_RETRY_ATTEMPTS {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(REASON_RETRY_DELAY) => {}
                }
            }
        }

        let (raw, parsed) = last.expect("at least one attempt ran");
        Ok(Verdict {
            score: parsed.score,
            best_answer: parsed.best_answer,
            reason: String::new(),
            raw_response: Some(raw),
        })
    }
}
