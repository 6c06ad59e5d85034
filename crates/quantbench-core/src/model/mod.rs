//! Core data model: run options fixed per results document, model
//! reference helpers, and the persisted results entities.

pub mod results;

pub use results::{
    BestAnswer, Judgment, ModelMetadata, QuestionResult, ResultsDocument, TokenLogprob,
    VariantResult,
};

use serde::{Deserialize, Serialize};

/// Generation settings captured once per results document. Every generate
/// request carries exactly these plus the resolved context length, so a
/// stored document stays comparable across resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub temperature: f64,
    pub seed: i64,
    pub top_p: f64,
    pub top_k: i64,
    pub repeat_penalty: f64,
    pub frequency_penalty: f64,
    #[serde(default)]
    pub think: bool,
    /// Opaque thinking level, forwarded to the server verbatim when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_level: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            seed: 42,
            top_p: 1.0,
            top_k: 1,
            repeat_penalty: 1.0,
            frequency_penalty: 0.0,
            think: false,
            think_level: None,
        }
    }
}

/// The tag token identifying a variant inside a results document: the
/// suffix after the last colon, or the full lowercased name for colon-less
/// third-party paths.
pub fn tag_token(model: &str) -> String {
    match model.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag.to_string(),
        _ => model.to_lowercase(),
    }
}

/// Whether a reference points at a third-party registry
/// (`host.tld/namespace/repo[:tag]`) rather than the server's own library.
pub fn is_registry_path(model: &str) -> bool {
    let head = model.split('/').next().unwrap_or("");
    model.matches('/').count() >= 2 && head.contains('.')
}

/// Split a third-party registry reference into host, namespace/repo path
/// and optional tag.
pub fn split_registry_path(model: &str) -> Option<(String, String, Option<String>)> {
    if !is_registry_path(model) {
        return None;
    }
    let (path, tag) = match model.rsplit_once(':') {
        Some((p, t)) if !t.contains('/') => (p, Some(t.to_string())),
        _ => (model, None),
    };
    let (host, repo) = path.split_once('/')?;
    Some((host.to_string(), repo.to_string(), tag))
}

/// Case-insensitive reference equality; the server may normalize casing
/// when it stores a pulled model.
pub fn same_model(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Tags the engine treats as an unquantized baseline when no base tag is
/// configured and the document carries no election.
pub fn looks_like_base_tag(tag: &str) -> bool {
    let t = tag.to_lowercase();
    t == "fp16" || t == "f16" || t == "bf16" || t == "fp32" || t == "f32" || t == "latest"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_token_uses_suffix_after_last_colon() {
        assert_eq!(tag_token("llama3.1:q4_0"), "q4_0");
        assert_eq!(tag_token("hf.co/ns/repo:Q4_K_M"), "Q4_K_M");
    }

    #[test]
    fn tag_token_falls_back_to_full_name() {
        assert_eq!(tag_token("hf.co/ns/repo"), "hf.co/ns/repo");
        assert_eq!(tag_token("HF.co/NS/Repo"), "hf.co/ns/repo");
    }

    #[test]
    fn registry_path_detection() {
        assert!(is_registry_path("hf.co/bartowski/Meta-Llama-3.1-8B-GGUF:Q4_K_M"));
        assert!(is_registry_path("hf.co/bartowski/Meta-Llama-3.1-8B-GGUF"));
        assert!(!is_registry_path("llama3.1:q4_0"));
        assert!(!is_registry_path("library/llama3.1"));
    }

    #[test]
    fn registry_path_split() {
        let (host, repo, tag) =
            split_registry_path("hf.co/bartowski/Llama-GGUF:Q4_K_M").expect("registry path");
        assert_eq!(host, "hf.co");
        assert_eq!(repo, "bartowski/Llama-GGUF");
        assert_eq!(tag.as_deref(), Some("Q4_K_M"));

        let (_, _, tag) = split_registry_path("hf.co/bartowski/Llama-GGUF").expect("registry path");
        assert!(tag.is_none());
    }

    #[test]
    fn base_tag_patterns() {
        assert!(looks_like_base_tag("fp16"));
        assert!(looks_like_base_tag("BF16"));
        assert!(!looks_like_base_tag("q4_K_M"));
    }
}
