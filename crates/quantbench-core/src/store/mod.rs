//! Results store: typed persistent document on disk. Atomic rewrite,
//! backup on open, corruption recovery, digest backfill, and the
//! compatibility validator binding a stored document to the current run.

pub mod recovery;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::client::InferenceClient;
use crate::model::{same_model, split_registry_path, ResultsDocument, RunOptions};
use crate::registry::RegistryClient;
use crate::retry::{CallKernel, RetryPolicy};

const MAX_BACKUPS: usize = 5;

pub use recovery::RepairStats;

#[derive(Clone)]
pub struct ResultsStore {
    path: PathBuf,
}

impl ResultsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default document path for a target model: path separators become
    /// dashes, suffix `.qc.json`.
    pub fn derive_path(model: &str, explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(format!("{}.qc.json", model.replace(['/', '\\'], "-"))),
        }
    }

    /// Load the document at the path, or create a fresh one. Existing
    /// documents are backed up first, recovered if unparseable, and
    /// validated against the current run's identity before any work runs.
    pub async fn open_or_create(
        &self,
        test_suite: &str,
        model: &str,
        options: &RunOptions,
    ) -> anyhow::Result<(ResultsDocument, bool)> {
        if !self.path.exists() {
            return Ok((ResultsDocument::new(test_suite, model, options.clone()), true));
        }

        self.backup().await?;

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let doc = match serde_json::from_str::<ResultsDocument>(&raw) {
            Ok(doc) => doc,
            Err(parse_err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %parse_err,
                    "results document is corrupted, attempting recovery"
                );
                let (doc, stats) = recovery::repair_document(&raw).with_context(|| {
                    format!(
                        "results document {} is unrecoverable; a backup copy was preserved",
                        self.path.display()
                    )
                })?;
                tracing::warn!(
                    truncated_arrays = stats.truncated_arrays,
                    truncated_objects = stats.truncated_objects,
                    removed_bytes = stats.removed_bytes,
                    fixed_closures = stats.fixed_closures,
                    "recovered results document"
                );
                doc
            }
        };

        self.validate_compat(&doc, test_suite, model)?;
        Ok((doc, false))
    }

    /// The document must belong to this run: same target model, same test
    /// suite. Anything else fails the run before work starts.
    pub fn validate_compat(
        &self,
        doc: &ResultsDocument,
        test_suite: &str,
        model: &str,
    ) -> anyhow::Result<()> {
        if !same_model(&doc.model_name, model) {
            anyhow::bail!(
                "results document {} was created for model '{}', not '{}'",
                self.path.display(),
                doc.model_name,
                model
            );
        }
        if doc.test_suite != test_suite {
            anyhow::bail!(
                "results document {} was created with test suite '{}', not '{}'",
                self.path.display(),
                doc.test_suite,
                test_suite
            );
        }
        Ok(())
    }

    async fn backup(&self) -> anyhow::Result<()> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let backup = self
            .path
            .with_file_name(format!(
                "{}.backup-{stamp}",
                self.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("results.qc.json"),
            ));
        tokio::fs::copy(&self.path, &backup)
            .await
            .with_context(|| format!("failed to back up {}", self.path.display()))?;
        self.prune_backups().await;
        Ok(())
    }

    /// Keep the five most recent backups; the stamp format sorts
    /// lexically.
    async fn prune_backups(&self) {
        let Some(parent) = self.path.parent().map(Path::to_path_buf) else {
            return;
        };
        let parent = if parent.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            parent
        };
        let Some(prefix) = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| format!("{n}.backup-"))
        else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(&parent) else {
            return;
        };
        let mut backups: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                backups.push(entry.path());
            }
        }
        backups.sort();
        while backups.len() > MAX_BACKUPS {
            let oldest = backups.remove(0);
            if let Err(e) = std::fs::remove_file(&oldest) {
                tracing::debug!(path = %oldest.display(), error = %e, "failed to prune backup");
            }
        }
    }

    /// Atomic rewrite: serialize to a `.tmp` sibling, flush, rename over
    /// the destination. The temporary file is removed on any error so no
    /// observable on-disk state ever fails to parse.
    pub async fn save(&self, doc: &ResultsDocument) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(doc).context("failed to serialize results")?;
        let tmp = self.path.with_extension("tmp");

        let write_result: anyhow::Result<()> = async {
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path)
                .await
                .with_context(|| format!("failed to replace {}", self.path.display()))?;
            Ok(())
        }
        .await;

        if write_result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        write_result
    }

    /// Fill in missing variant digests: from the server listing when the
    /// model is stored locally, else from the third-party registry
    /// manifest.
    pub async fn backfill_digests(
        &self,
        doc: &mut ResultsDocument,
        client: &Arc<InferenceClient>,
        registry: &Arc<RegistryClient>,
        kernel: &CallKernel,
    ) -> anyhow::Result<()> {
        if doc.variants.iter().all(|v| !v.metadata.digest.is_empty()) {
            return Ok(());
        }
        let listed = kernel
            .call("tags", RetryPolicy::normal(), || client.list())
            .await
            .unwrap_or_default();

        for variant in &mut doc.variants {
            if !variant.metadata.digest.is_empty() {
                continue;
            }
            if let Some(m) = listed.iter().find(|m| same_model(&m.name, &variant.model_name)) {
                if !m.digest.is_empty() {
                    variant.metadata.digest = m.digest.clone();
                    continue;
                }
            }
            if let Some((host, repo, Some(tag))) = split_registry_path(&variant.model_name) {
                match registry.manifest_digest(&host, &repo, &tag).await {
                    Ok(digest) => variant.metadata.digest = digest,
                    Err(e) => tracing::warn!(
                        model = %variant.model_name,
                        error = %e,
                        "digest backfill failed"
                    ),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VariantResult;

    fn doc() -> ResultsDocument {
        let mut d = ResultsDocument::new("default", "llama3.1", RunOptions::default());
        d.upsert_variant(VariantResult::new("fp16", "llama3.1:fp16"));
        d
    }

    #[test]
    fn path_derivation_replaces_separators() {
        assert_eq!(
            ResultsStore::derive_path("hf.co/ns/repo", None),
            PathBuf::from("hf.co-ns-repo.qc.json")
        );
        assert_eq!(
            ResultsStore::derive_path("llama3.1", Some(Path::new("out.json"))),
            PathBuf::from("out.json")
        );
    }

    #[tokio::test]
    async fn save_then_open_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultsStore::new(dir.path().join("llama3.1.qc.json"));
        store.save(&doc()).await.expect("save");

        let (loaded, created) = store
            .open_or_create("default", "llama3.1", &RunOptions::default())
            .await
            .expect("open");
        assert!(!created);
        assert_eq!(loaded.variants.len(), 1);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn open_creates_fresh_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultsStore::new(dir.path().join("new.qc.json"));
        let (loaded, created) = store
            .open_or_create("default", "llama3.1", &RunOptions::default())
            .await
            .expect("open");
        assert!(created);
        assert!(loaded.variants.is_empty());
    }

    #[tokio::test]
    async fn incompatible_document_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultsStore::new(dir.path().join("llama3.1.qc.json"));
        store.save(&doc()).await.expect("save");

        let err = store
            .open_or_create("default", "mistral", &RunOptions::default())
            .await
            .expect_err("wrong model");
        assert!(err.to_string().contains("mistral"));

        let err = store
            .open_or_create("other-suite", "llama3.1", &RunOptions::default())
            .await
            .expect_err("wrong suite");
        assert!(err.to_string().contains("other-suite"));
    }

    #[tokio::test]
    async fn open_backs_up_and_recovers_truncated_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultsStore::new(dir.path().join("llama3.1.qc.json"));

        let mut d = doc();
        d.variant_mut("fp16").unwrap().questions.push(
            serde_json::from_value(serde_json::json!({
                "questionId": "q1",
                "category": "c",
                "prompt": "p",
                "answer": "a",
                "evalTokensPerSecond": 1.0,
                "promptTokensPerSecond": 1.0,
                "totalTokens": 1,
                "ctxSize": 2048
            }))
            .expect("question"),
        );
        let json = serde_json::to_string_pretty(&d).expect("serialize");
        let truncated = &json[..json.len() - 20];
        std::fs::write(store.path(), truncated).expect("write corrupted");

        let (loaded, created) = store
            .open_or_create("default", "llama3.1", &RunOptions::default())
            .await
            .expect("recovers");
        assert!(!created);
        assert_eq!(loaded.variants.len(), 1);

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup-"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn backups_are_pruned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultsStore::new(dir.path().join("llama3.1.qc.json"));
        store.save(&doc()).await.expect("save");

        for _ in 0..8 {
            store.backup().await.expect("backup");
            // Distinct millisecond stamps.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup-"))
            .collect();
        assert!(backups.len() <= MAX_BACKUPS);
    }
}
