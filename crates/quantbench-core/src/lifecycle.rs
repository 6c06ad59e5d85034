//! Model lifecycle against the shared inference server: prepare (load or
//! keep-alive reset), on-demand pull with a two-phase retry ladder,
//! canonical-name re-resolution, idempotent delete, unload plumbing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::InferenceClient;
use crate::errors::ClientError;
use crate::model::{same_model, split_registry_path};
use crate::progress::{PullProgress, Reporter};
use crate::registry::RegistryClient;
use crate::retry::{CallKernel, RetryPolicy};

const UNLOAD_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
const UNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);
const UNLOAD_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Quick phase rides out IP-based rate-limit rotation; the slow phase
/// consults the registry's reset hint when a token is configured.
const PULL_QUICK_ATTEMPTS: u32 = 50;
const PULL_QUICK_DELAY: Duration = Duration::from_secs(2);
const PULL_SLOW_ATTEMPTS: u32 = 50;
const PULL_SLOW_DELAY: Duration = Duration::from_secs(30);

pub struct ModelLifecycle {
    client: Arc<InferenceClient>,
    registry: Arc<RegistryClient>,
    kernel: CallKernel,
    reporter: Reporter,
    no_unload_all: bool,
}

impl ModelLifecycle {
    pub fn new(
        client: Arc<InferenceClient>,
        registry: Arc<RegistryClient>,
        kernel: CallKernel,
        reporter: Reporter,
        no_unload_all: bool,
    ) -> Self {
        Self {
            client,
            registry,
            kernel,
            reporter,
            no_unload_all,
        }
    }

    /// Bring `model` up for generation. A single matching loaded model
    /// only gets its keep-alive refreshed; anything else is unloaded
    /// first, then a minimal chat round initializes the engine properly
    /// for logprob extraction.
    pub async fn prepare(&self, model: &str, num_ctx: u64, keep_alive: &str) -> Result<(), ClientError> {
        let loaded = self
            .kernel
            .call("ps", RetryPolicy::normal(), || self.client.ps_loaded())
            .await?;

        if loaded.len() == 1 && same_model(&loaded[0], model) {
            tracing::debug!(model, "already loaded, refreshing keep-alive");
            return self
                .kernel
                .call("keep-alive", RetryPolicy::normal(), || {
                    self.client.preload_keep_alive(model, keep_alive)
                })
                .await;
        }

        if !loaded.is_empty() && !self.no_unload_all {
            self.unload_all(&loaded).await?;
            self.wait_for_unload().await?;
        }

        self.kernel
            .call("load", RetryPolicy::normal(), || {
                self.client.chat_load(model, num_ctx)
            })
            .await
    }

    /// Refresh the keep-alive timer without any load dance.
    pub async fn refresh_keep_alive(&self, model: &str, keep_alive: &str) -> Result<(), ClientError> {
        self.kernel
            .call("keep-alive", RetryPolicy::normal(), || {
                self.client.preload_keep_alive(model, keep_alive)
            })
            .await
    }

    pub async fn unload_all(&self, loaded: &[String]) -> Result<(), ClientError> {
        for name in loaded {
            tracing::debug!(model = %name, "unloading");
            self.kernel
                .call("unload", RetryPolicy::normal(), || self.client.unload(name))
                .await?;
        }
        Ok(())
    }

    /// Poll process status until the server reflects the unload, bounded
    /// at 30 s, then give the runtime a short settling delay.
    pub async fn wait_for_unload(&self) -> Result<(), ClientError> {
        let cancel = self.kernel.cancel_token();
        let deadline = Instant::now() + UNLOAD_SETTLE_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            match self.client.ps_loaded().await {
                Ok(loaded) if loaded.is_empty() => break,
                Ok(_) | Err(_) if Instant::now() >= deadline => break,
                _ => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(UNLOAD_POLL_INTERVAL) => {}
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = tokio::time::sleep(UNLOAD_SETTLE_DELAY) => Ok(()),
        }
    }

    /// Streamed on-demand pull with the two-phase retry ladder. Layer
    /// completion observed within an attempt resets the attempt counter;
    /// a missing model short-circuits everything.
    pub async fn pull_on_demand(&self, model: &str) -> Result<(), ClientError> {
        let cancel = self.kernel.cancel_token();
        let mut layers_done: HashSet<String> = HashSet::new();
        let mut last_err = ClientError::Network("pull never attempted".into());

        let phases = [
            (PULL_QUICK_ATTEMPTS, PULL_QUICK_DELAY, false),
            (PULL_SLOW_ATTEMPTS, PULL_SLOW_DELAY, true),
        ];
        for (max_attempts, default_delay, consult_registry) in phases {
            let mut attempt = 0u32;
            while attempt < max_attempts {
                if cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }
                attempt += 1;
                let before = layers_done.len();
                let reporter = self.reporter.clone();
                let result = self
                    .client
                    .pull(model, &cancel, |rec| {
                        if let (Some(digest), Some(completed), Some(total)) =
                            (&rec.digest, rec.completed, rec.total)
                        {
                            if total > 0 && completed >= total {
                                layers_done.insert(digest.clone());
                            }
                        }
                        (reporter.on_pull)(PullProgress {
                            model: model.to_string(),
                            status: rec.status.clone(),
                            digest: rec.digest.clone(),
                            completed: rec.completed.unwrap_or(0),
                            total: rec.total.unwrap_or(0),
                        });
                    })
                    .await;

                match result {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_cancelled() || e.is_not_found() => return Err(e),
                    Err(e) => {
                        if layers_done.len() > before {
                            tracing::info!(model, "pull made progress, resetting retry counter");
                            attempt = 0;
                        }
                        let delay = self
                            .registry_reset_delay(model, consult_registry)
                            .await
                            .unwrap_or(default_delay);
                        tracing::warn!(model, attempt, ?delay, error = %e, "pull failed, retrying");
                        last_err = e;
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn registry_reset_delay(&self, model: &str, consult: bool) -> Option<Duration> {
        if !consult || !self.registry.has_token() {
            return None;
        }
        let (host, repo, _) = split_registry_path(model)?;
        self.registry.rate_limit_reset(&host, &repo).await
    }

    /// After a pull the server may have normalized casing; re-query the
    /// tag list and return the canonically stored name.
    pub async fn resolve_stored_name(&self, model: &str) -> Result<String, ClientError> {
        let listed = self
            .kernel
            .call("tags", RetryPolicy::normal(), || self.client.list())
            .await?;
        Ok(listed
            .into_iter()
            .map(|m| m.name)
            .find(|name| same_model(name, model))
            .unwrap_or_else(|| model.to_string()))
    }

    /// Idempotent delete; "not found" counts as success.
    pub async fn delete(&self, model: &str) -> Result<(), ClientError> {
        match self
            .kernel
            .call("delete", RetryPolicy::normal(), || self.client.delete(model))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
