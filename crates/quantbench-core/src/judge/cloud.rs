//! Cloud judge back-ends. A registry maps a provider token (`@claude`,
//! `@openai`, ...) to its endpoint shape, auth header and env-var key
//! sources; each provider is one variant of a small request/response
//! adapter. Keys come from the command line (`@provider:key/model`,
//! Azure's `key@endpoint`) or the per-provider environment list.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;

use super::{JudgeBackend, JudgeIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    /// OpenAI-style chat completions: OpenAI, Mistral, Together,
    /// HuggingFace router.
    OpenAiCompat,
    Gemini,
    AzureOpenAi,
    Cohere,
    Replicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSpec {
    pub token: &'static str,
    pub name: &'static str,
    pub kind: ProviderKind,
    pub default_model: &'static str,
    pub endpoint: &'static str,
    pub env_keys: &'static [&'static str],
    pub api_version: Option<&'static str>,
}

pub const PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        token: "@claude",
        name: "anthropic",
        kind: ProviderKind::Anthropic,
        default_model: "claude-sonnet-4-5",
        endpoint: "https://api.anthropic.com/v1/messages",
        env_keys: &["ANTHROPIC_API_KEY"],
        api_version: Some("2023-06-01"),
    },
    ProviderSpec {
        token: "@openai",
        name: "openai",
        kind: ProviderKind::OpenAiCompat,
        default_model: "gpt-4o-mini",
        endpoint: "https://api.openai.com/v1/chat/completions",
        env_keys: &["OPENAI_API_KEY"],
        api_version: None,
    },
    ProviderSpec {
        token: "@gemini",
        name: "gemini",
        kind: ProviderKind::Gemini,
        default_model: "gemini-2.0-flash",
        endpoint: "https://generativelanguage.googleapis.com/v1beta",
        env_keys: &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        api_version: Some("v1beta"),
    },
    ProviderSpec {
        token: "@huggingface",
        name: "huggingface",
        kind: ProviderKind::OpenAiCompat,
        default_model: "meta-llama/Llama-3.3-70B-Instruct",
        endpoint: "https://router.huggingface.co/v1/chat/completions",
        env_keys: &["HF_TOKEN", "HUGGINGFACE_TOKEN"],
        api_version: None,
    },
    ProviderSpec {
        token: "@azure",
        name: "azure",
        kind: ProviderKind::AzureOpenAi,
        default_model: "gpt-4o-mini",
        endpoint: "",
        env_keys: &["AZURE_OPENAI_API_KEY"],
        api_version: Some("2024-06-01"),
    },
    ProviderSpec {
        token: "@cohere",
        name: "cohere",
        kind: ProviderKind::Cohere,
        default_model: "command-r-plus",
        endpoint: "https://api.cohere.com/v2/chat",
        env_keys: &["CO_API_KEY", "COHERE_API_KEY"],
        api_version: None,
    },
    ProviderSpec {
        token: "@mistral",
        name: "mistral",
        kind: ProviderKind::OpenAiCompat,
        default_model: "mistral-large-latest",
        endpoint: "https://api.mistral.ai/v1/chat/completions",
        env_keys: &["MISTRAL_API_KEY"],
        api_version: None,
    },
    ProviderSpec {
        token: "@together",
        name: "together",
        kind: ProviderKind::OpenAiCompat,
        default_model: "meta-llama/Llama-3.3-70B-Instruct-Turbo",
        endpoint: "https://api.together.xyz/v1/chat/completions",
        env_keys: &["TOGETHER_API_KEY"],
        api_version: None,
    },
    ProviderSpec {
        token: "@replicate",
        name: "replicate",
        kind: ProviderKind::Replicate,
        default_model: "meta/meta-llama-3-70b-instruct",
        endpoint: "https://api.replicate.com/v1",
        env_keys: &["REPLICATE_API_TOKEN"],
        api_version: None,
    },
];

pub fn provider_by_token(token: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|p| p.token.eq_ignore_ascii_case(token))
}

/// Parsed `--judge`/`--judgebest` specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeSpec {
    /// Server judge: a model name, optionally pinned to a different
    /// endpoint via `model@http://host:port`.
    Local {
        model: String,
        endpoint: Option<String>,
    },
    Cloud {
        provider: &'static ProviderSpec,
        key: Option<String>,
        model: Option<String>,
        /// Azure resource endpoint from `key@endpoint`.
        endpoint: Option<String>,
    },
}

impl JudgeSpec {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            anyhow::bail!("empty judge specifier");
        }
        if !raw.starts_with('@') {
            return Ok(match raw.split_once('@') {
                Some((model, endpoint)) if endpoint.starts_with("http") => JudgeSpec::Local {
                    model: model.to_string(),
                    endpoint: Some(endpoint.to_string()),
                },
                _ => JudgeSpec::Local {
                    model: raw.to_string(),
                    endpoint: None,
                },
            });
        }

        let (token, rest) = match raw.split_once(':') {
            Some((t, r)) => (t, Some(r)),
            None => (raw, None),
        };
        let provider = provider_by_token(token)
            .ok_or_else(|| anyhow::anyhow!("unknown cloud provider '{token}'"))?;

        let (mut key, mut model, mut endpoint) = (None, None, None);
        if let Some(rest) = rest {
            if provider.kind == ProviderKind::AzureOpenAi {
                // Azure uses `key@endpoint`; the endpoint is a URL, so no
                // model segment is split off it.
                match rest.split_once('@') {
                    Some((k, ep)) => {
                        key = Some(k.to_string());
                        endpoint = Some(ep.to_string());
                    }
                    None => key = Some(rest.to_string()),
                }
            } else {
                let (key_part, model_part) = match rest.split_once('/') {
                    Some((k, m)) => (k, Some(m.to_string())),
                    None => (rest, None),
                };
                model = model_part;
                if !key_part.is_empty() {
                    key = Some(key_part.to_string());
                }
            }
        }
        Ok(JudgeSpec::Cloud {
            provider,
            key,
            model,
            endpoint,
        })
    }
}

pub struct CloudJudge {
    spec: &'static ProviderSpec,
    model: String,
    key: String,
    endpoint: String,
    http: reqwest::Client,
}

impl CloudJudge {
    pub fn from_spec(
        provider: &'static ProviderSpec,
        key: Option<String>,
        model: Option<String>,
        endpoint: Option<String>,
    ) -> anyhow::Result<Self> {
        let key = key
            .or_else(|| {
                provider
                    .env_keys
                    .iter()
                    .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
            })
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no API key for {}; pass {}:<key> or set {}",
                    provider.name,
                    provider.token,
                    provider.env_keys.join(" / ")
                )
            })?;
        let endpoint = match provider.kind {
            ProviderKind::AzureOpenAi => endpoint
                .or_else(|| std::env::var("AZURE_OPENAI_ENDPOINT").ok().filter(|v| !v.is_empty()))
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "azure judge needs an endpoint; pass @azure:<key>@<endpoint> or set AZURE_OPENAI_ENDPOINT"
                    )
                })?,
            _ => provider.endpoint.to_string(),
        };
        Ok(Self {
            spec: provider,
            model: model.unwrap_or_else(|| provider.default_model.to_string()),
            key,
            endpoint,
            http: reqwest::Client::builder().build()?,
        })
    }

    fn request(&self, system: &str, user: &str, max_tokens: u32) -> (String, reqwest::RequestBuilder, Value) {
        match self.spec.kind {
            ProviderKind::Anthropic => {
                let url = self.endpoint.clone();
                let body = json!({
                    "model": self.model,
                    "max_tokens": max_tokens,
                    "temperature": 0.0,
                    "system": system,
                    "messages": [{ "role": "user", "content": user }],
                });
                let req = self
                    .http
                    .post(&url)
                    .header("x-api-key", &self.key)
                    .header("anthropic-version", self.spec.api_version.unwrap_or("2023-06-01"));
                (url, req, body)
            }
            ProviderKind::OpenAiCompat => {
                let url = self.endpoint.clone();
                let body = json!({
                    "model": self.model,
                    "temperature": 0.0,
                    "max_tokens": max_tokens,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user },
                    ],
                });
                let req = self.http.post(&url).bearer_auth(&self.key);
                (url, req, body)
            }
            ProviderKind::Gemini => {
                let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
                let body = json!({
                    "system_instruction": { "parts": [{ "text": system }] },
                    "contents": [{ "role": "user", "parts": [{ "text": user }] }],
                    "generationConfig": {
                        "temperature": 0.0,
                        "maxOutputTokens": max_tokens,
                    },
                });
                let req = self.http.post(&url).header("x-goog-api-key", &self.key);
                (url, req, body)
            }
            ProviderKind::AzureOpenAi => {
                let url = format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    self.endpoint.trim_end_matches('/'),
                    self.model,
                    self.spec.api_version.unwrap_or("2024-06-01"),
                );
                let body = json!({
                    "temperature": 0.0,
                    "max_tokens": max_tokens,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user },
                    ],
                });
                let req = self.http.post(&url).header("api-key", &self.key);
                (url, req, body)
            }
            ProviderKind::Cohere => {
                let url = self.endpoint.clone();
                let body = json!({
                    "model": self.model,
                    "temperature": 0.0,
                    "max_tokens": max_tokens,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user },
                    ],
                });
                let req = self.http.post(&url).bearer_auth(&self.key);
                (url, req, body)
            }
            ProviderKind::Replicate => {
                let url = format!("{}/models/{}/predictions", self.endpoint, self.model);
                let body = json!({
                    "input": {
                        "prompt": user,
                        "system_prompt": system,
                        "temperature": 0.0,
                        "max_tokens": max_tokens,
                    },
                });
                let req = self
                    .http
                    .post(&url)
                    .bearer_auth(&self.key)
                    .header("Prefer", "wait");
                (url, req, body)
            }
        }
    }

    fn extract_text(&self, value: &Value) -> Option<String> {
        match self.spec.kind {
            ProviderKind::Anthropic => value
                .pointer("/content/0/text")
                .and_then(Value::as_str)
                .map(str::to_string),
            ProviderKind::OpenAiCompat | ProviderKind::AzureOpenAi => value
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(str::to_string),
            ProviderKind::Gemini => value
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str)
                .map(str::to_string),
            ProviderKind::Cohere => value
                .pointer("/message/content/0/text")
                .and_then(Value::as_str)
                .map(str::to_string),
            ProviderKind::Replicate => match value.get("output") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Array(parts)) => Some(
                    parts
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(""),
                ),
                _ => None,
            },
        }
    }
}

#[async_trait]
impl JudgeBackend for CloudJudge {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        _test_ctx: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let (url, req, body) = self.request(system, user, max_tokens);
        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(ClientError::from_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let reset = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), text, reset));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Network(format!("invalid {} response: {e}", self.spec.name)))?;
        self.extract_text(&value).ok_or_else(|| {
            ClientError::Network(format!("{} response carried no text ({url})", self.spec.name))
        })
    }

    fn identity(&self) -> JudgeIdentity {
        JudgeIdentity {
            model: self.model.clone(),
            provider: self.spec.name.to_string(),
            api_version: self.spec.api_version.map(str::to_string),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.key.is_empty() {
            anyhow::bail!("{} API key is empty", self.spec.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_the_closed_provider_set() {
        let tokens: Vec<&str> = PROVIDERS.iter().map(|p| p.token).collect();
        for expected in [
            "@claude",
            "@openai",
            "@gemini",
            "@huggingface",
            "@azure",
            "@cohere",
            "@mistral",
            "@together",
            "@replicate",
        ] {
            assert!(tokens.contains(&expected), "missing {expected}");
        }
        assert_eq!(PROVIDERS.len(), 9);
    }

    #[test]
    fn parse_local_specs() {
        assert_eq!(
            JudgeSpec::parse("qwen2.5:14b").expect("spec"),
            JudgeSpec::Local {
                model: "qwen2.5:14b".into(),
                endpoint: None
            }
        );
        assert_eq!(
            JudgeSpec::parse("qwen2.5:14b@http://judge:11434").expect("spec"),
            JudgeSpec::Local {
                model: "qwen2.5:14b".into(),
                endpoint: Some("http://judge:11434".into())
            }
        );
    }

    #[test]
    fn parse_cloud_specs() {
        match JudgeSpec::parse("@claude").expect("spec") {
            JudgeSpec::Cloud {
                provider,
                key,
                model,
                endpoint,
            } => {
                assert_eq!(provider.name, "anthropic");
                assert!(key.is_none() && model.is_none() && endpoint.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        match JudgeSpec::parse("@openai:sk-123/gpt-4o").expect("spec") {
            JudgeSpec::Cloud { provider, key, model, .. } => {
                assert_eq!(provider.name, "openai");
                assert_eq!(key.as_deref(), Some("sk-123"));
                assert_eq!(model.as_deref(), Some("gpt-4o"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_azure_key_at_endpoint() {
        match JudgeSpec::parse("@azure:abc@https://res.openai.azure.com").expect("spec") {
            JudgeSpec::Cloud {
                provider,
                key,
                model,
                endpoint,
            } => {
                assert_eq!(provider.name, "azure");
                assert_eq!(key.as_deref(), Some("abc"));
                assert_eq!(endpoint.as_deref(), Some("https://res.openai.azure.com"));
                assert!(model.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let err = JudgeSpec::parse("@grok").expect_err("unknown provider");
        assert!(err.to_string().contains("unknown cloud provider"));
    }
}
