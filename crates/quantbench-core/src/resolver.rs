//! Tag resolver: expands wildcard variant specifiers against the server's
//! own tag listing or a third-party registry into a concrete ordered set
//! of fully qualified model references.

use regex::RegexBuilder;

use crate::client::InferenceClient;
use crate::errors::ClientError;
use crate::model::split_registry_path;
use crate::registry::RegistryClient;

pub struct TagResolver<'a> {
    client: &'a InferenceClient,
    registry: &'a RegistryClient,
}

impl<'a> TagResolver<'a> {
    pub fn new(client: &'a InferenceClient, registry: &'a RegistryClient) -> Self {
        Self { client, registry }
    }

    /// Expand every specifier into fully qualified references. Wildcard
    /// expansion preserves registry ordering and de-duplicates
    /// case-insensitively across the whole set; non-wildcard inputs pass
    /// through unchanged.
    pub async fn expand(
        &self,
        model_source: &str,
        specs: &[String],
    ) -> Result<Vec<String>, ClientError> {
        fn push(name: String, out: &mut Vec<String>, seen: &mut Vec<String>) {
            let key = name.to_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
                out.push(name);
            }
        }

        let mut out: Vec<String> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for spec in specs {
            if !spec.contains('*') {
                push(self.qualify(model_source, spec), &mut out, &mut seen);
                continue;
            }
            for name in self.expand_one(model_source, spec).await? {
                push(name, &mut out, &mut seen);
            }
        }
        Ok(out)
    }

    async fn expand_one(
        &self,
        model_source: &str,
        spec: &str,
    ) -> Result<Vec<String>, ClientError> {
        // A wildcard spec may carry its own registry path, e.g.
        // `hf.co/ns/repo:Q4*`; otherwise the run's model source decides
        // where tags come from.
        let (source, pattern) = match split_registry_path(spec) {
            Some((host, repo, tag)) => (
                format!("{host}/{repo}"),
                tag.unwrap_or_else(|| "*".to_string()),
            ),
            None => (model_source.to_string(), spec.to_string()),
        };

        if let Some((host, repo, _)) = split_registry_path(&source) {
            let tags = self.registry.tags(&host, &repo).await?;
            Ok(tags
                .iter()
                .filter(|t| wildcard_match(&pattern, t))
                .map(|t| format!("{host}/{repo}:{t}"))
                .collect())
        } else {
            let family = source.split(':').next().unwrap_or(&source);
            let listed = self.client.list().await?;
            let prefix = format!("{}:", family.to_lowercase());
            Ok(listed
                .iter()
                .filter(|m| m.name.to_lowercase().starts_with(&prefix))
                .filter_map(|m| m.name.rsplit_once(':').map(|(_, t)| (m.name.as_str(), t)))
                .filter(|(_, tag)| wildcard_match(&pattern, tag))
                .map(|(name, _)| name.to_string())
                .collect())
        }
    }

    fn qualify(&self, model_source: &str, spec: &str) -> String {
        if spec.contains('/') || spec.contains(':') {
            return spec.to_string();
        }
        let family = model_source.split(':').next().unwrap_or(model_source);
        format!("{family}:{spec}")
    }
}

/// Case-insensitive `*` glob over a whole tag.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    RegexBuilder::new(&format!("^{escaped}$"))
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(candidate))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("Q4*", "q4_K_M"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("Q4*M", "Q4_K_M"));
        assert!(!wildcard_match("Q4*", "Q5_K_M"));
        assert!(!wildcard_match("Q4", "Q4_K_M"));
    }

    #[test]
    fn wildcard_escapes_regex_metacharacters() {
        assert!(wildcard_match("llama3.1*", "llama3.1-instruct"));
        assert!(!wildcard_match("llama3.1*", "llama321"));
    }
}
