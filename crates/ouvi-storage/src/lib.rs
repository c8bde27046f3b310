//! Durable quarantine storage for rows and batches the pipeline rejects.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ouvi-storage";

/// Pipeline stage that produced a failure artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Ingest,
    Transform,
    Delta,
    Append,
    Patch,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Ingest => "ingest",
            FailureStage::Transform => "transform",
            FailureStage::Delta => "delta",
            FailureStage::Append => "append",
            FailureStage::Patch => "patch",
        }
    }
}

/// One rejected row or batch, kept verbatim so a rerun or operator can
/// recover it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureArtifact {
    pub run_id: Uuid,
    pub stage: FailureStage,
    pub reason: String,
    pub protocol: Option<String>,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredFailure {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed JSON store. Identical artifacts land on the same path, so
/// a retried run never duplicates quarantine entries.
#[derive(Debug, Clone)]
pub struct FailureStore {
    root: PathBuf,
}

impl FailureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn failure_relative_path(
        &self,
        recorded_at: DateTime<Utc>,
        stage: FailureStage,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = recorded_at.format("%Y%m%d").to_string();
        PathBuf::from(stamp)
            .join(stage.as_str())
            .join(format!("{content_hash}.json"))
    }

    /// Persist one artifact via temp-file write and atomic rename. Content
    /// addressing excludes `recorded_at` and `run_id`, so the same rejected
    /// payload reported twice stores once per day.
    pub fn record(&self, artifact: &FailureArtifact) -> anyhow::Result<StoredFailure> {
        let address = serde_json::json!({
            "stage": artifact.stage,
            "reason": artifact.reason,
            "protocol": artifact.protocol,
            "payload": artifact.payload,
        });
        let address_bytes =
            serde_json::to_vec(&address).context("serializing failure address")?;
        let content_hash = Self::sha256_hex(&address_bytes);

        let bytes =
            serde_json::to_vec_pretty(artifact).context("serializing failure artifact")?;
        let relative_path =
            self.failure_relative_path(artifact.recorded_at, artifact.stage, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating failure directory {}", parent.display()))?;
        }

        if absolute_path.exists() {
            return Ok(StoredFailure {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("failure path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp failure file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("writing temp failure file {}", temp_path.display()))?;
        file.flush()
            .with_context(|| format!("flushing temp failure file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path) {
            Ok(()) => Ok(StoredFailure {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path);
                Ok(StoredFailure {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp failure {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Read back every artifact stored under the root, any day, any stage.
    pub fn load_all(&self) -> anyhow::Result<Vec<FailureArtifact>> {
        let mut artifacts = Vec::new();
        if !self.root.exists() {
            return Ok(artifacts);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)
                .with_context(|| format!("reading failure directory {}", dir.display()))?
            {
                let path = entry
                    .with_context(|| format!("reading entry in {}", dir.display()))?
                    .path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("reading failure file {}", path.display()))?;
                    let artifact: FailureArtifact = serde_json::from_str(&text)
                        .with_context(|| format!("parsing failure file {}", path.display()))?;
                    artifacts.push(artifact);
                }
            }
        }
        artifacts.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn artifact(reason: &str) -> FailureArtifact {
        FailureArtifact {
            run_id: Uuid::new_v4(),
            stage: FailureStage::Patch,
            reason: reason.to_string(),
            protocol: Some("2024-000123".to_string()),
            payload: serde_json::json!({ "status_demanda": "EM ANDAMENTO" }),
            recorded_at: DateTime::parse_from_rfc3339("2026-08-29T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn failure_hashing_is_stable() {
        let hash = FailureStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn identical_failures_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = FailureStore::new(dir.path());

        let first = store.record(&artifact("key missing in sink")).expect("first");
        let second = store.record(&artifact("key missing in sink")).expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn run_id_does_not_affect_content_address() {
        let dir = tempdir().expect("tempdir");
        let store = FailureStore::new(dir.path());

        let mut a = artifact("unparseable date");
        let mut b = artifact("unparseable date");
        a.run_id = Uuid::new_v4();
        b.run_id = Uuid::new_v4();

        let first = store.record(&a).expect("first");
        let second = store.record(&b).expect("second");
        assert_eq!(first.content_hash, second.content_hash);
        assert!(second.deduplicated);
    }

    #[test]
    fn stored_artifacts_load_back() {
        let dir = tempdir().expect("tempdir");
        let store = FailureStore::new(dir.path());

        store.record(&artifact("first")).expect("store first");
        store.record(&artifact("second")).expect("store second");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|a| a.stage == FailureStage::Patch));
        assert!(loaded.iter().any(|a| a.reason == "first"));
    }
}
