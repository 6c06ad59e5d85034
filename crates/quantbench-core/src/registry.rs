//! Client for third-party OCI model registries (`hf.co/ns/repo` paths):
//! tag listing for wildcard expansion, manifest fetch for the digest
//! fallback, and rate-limit reset probing for slow-phase pull retries.

use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::errors::ClientError;

/// Reset delays derived from registry headers are capped at this.
pub const MAX_RATE_LIMIT_RESET: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, token })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Tags known to the registry for `host/repo`, in registry order.
    pub async fn tags(&self, host: &str, repo: &str) -> Result<Vec<String>, ClientError> {
        let url = format!("https://{host}/v2/{repo}/tags/list");
        let resp = self
            .auth(self.http.get(&url))
            .send()
            .await
            .map_err(ClientError::from_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let reset = rate_limit_reset(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body, reset));
        }
        let list: TagList = resp
            .json()
            .await
            .map_err(|e| ClientError::Network(format!("invalid tag list: {e}")))?;
        Ok(list.tags)
    }

    /// Content digest for a tag. Prefers the digest header the registry
    /// advertises; otherwise the SHA-256 of the fetched manifest body is a
    /// deterministic fallback.
    pub async fn manifest_digest(
        &self,
        host: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String, ClientError> {
        let url = format!("https://{host}/v2/{repo}/manifests/{tag}");
        let resp = self
            .auth(self.http.get(&url))
            .header(
                reqwest::header::ACCEPT,
                "application/vnd.docker.distribution.manifest.v2+json",
            )
            .send()
            .await
            .map_err(ClientError::from_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body, None));
        }
        if let Some(digest) = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            return Ok(digest.to_string());
        }
        let body = resp
            .bytes()
            .await
            .map_err(ClientError::from_transport)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&body))))
    }

    /// Probe the registry's advertised rate-limit reset. Used to derive
    /// the slow-phase pull retry delay when a token is configured.
    pub async fn rate_limit_reset(&self, host: &str, repo: &str) -> Option<Duration> {
        let url = format!("https://{host}/v2/{repo}/tags/list");
        let resp = self.auth(self.http.get(&url)).send().await.ok()?;
        rate_limit_reset(resp.headers())
    }
}

fn rate_limit_reset(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    for name in ["ratelimit-reset", "x-ratelimit-reset", "retry-after"] {
        if let Some(secs) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            return Some(Duration::from_secs(secs).min(MAX_RATE_LIMIT_RESET));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn reset_header_is_capped() {
        let mut headers = HeaderMap::new();
        headers.insert("ratelimit-reset", HeaderValue::from_static("900"));
        assert_eq!(rate_limit_reset(&headers), Some(MAX_RATE_LIMIT_RESET));

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("42"));
        assert_eq!(rate_limit_reset(&headers), Some(Duration::from_secs(42)));

        assert_eq!(rate_limit_reset(&HeaderMap::new()), None);
    }
}
