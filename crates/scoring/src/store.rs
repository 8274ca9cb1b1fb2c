//! Versioned model artifact storage.
//!
//! Readers of [`ModelStore::current`] get an `Arc` snapshot; [`ModelStore::publish`]
//! swaps the pointer only after the new artifact is fully persisted, so a
//! reader sees either the old artifact or the new one, never a partial write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::ModelArtifact;
use crate::error::{ModelLoadError, ModelStoreError};

/// Model artifact store abstraction.
pub trait ModelStore: Send + Sync {
    /// The artifact scoring should use, if any.
    fn current(&self) -> Option<Arc<ModelArtifact>>;

    /// Append `artifact` to the history and make it current.
    ///
    /// Fails with [`ModelStoreError::StaleVersion`] unless the version is
    /// strictly greater than the current one.
    fn publish(&self, artifact: ModelArtifact) -> Result<Arc<ModelArtifact>, ModelStoreError>;

    /// Publish `artifact` under the next free version, replacing the version
    /// it carries. Concurrent publishers each get their own version.
    fn publish_next(&self, artifact: ModelArtifact)
    -> Result<Arc<ModelArtifact>, ModelStoreError>;

    /// All artifacts, most recent first.
    fn history(&self) -> Vec<Arc<ModelArtifact>>;

    /// Version the next published artifact should carry.
    fn next_version(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Versioning {
    AsGiven,
    Next,
}

/// Append-only artifact log with an atomically swapped "current" pointer.
///
/// The publish mutex serialises writers; readers only take the `RwLock`s long
/// enough to clone an `Arc`.
#[derive(Debug, Default)]
struct ArtifactLog {
    publish: Mutex<()>,
    current: RwLock<Option<Arc<ModelArtifact>>>,
    history: RwLock<Vec<Arc<ModelArtifact>>>,
    /// Highest version known to be taken, readable or not.
    taken: u64,
}

impl ArtifactLog {
    fn seeded(
        history: Vec<Arc<ModelArtifact>>,
        current: Option<Arc<ModelArtifact>>,
        taken: u64,
    ) -> Self {
        Self {
            publish: Mutex::new(()),
            current: RwLock::new(current),
            history: RwLock::new(history),
            taken,
        }
    }

    fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.current.read().ok()?.clone()
    }

    fn history(&self) -> Vec<Arc<ModelArtifact>> {
        match self.history.read() {
            Ok(h) => h.iter().rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn latest_version(&self) -> u64 {
        self.history
            .read()
            .ok()
            .and_then(|h| h.last().map(|a| a.version))
            .unwrap_or(0)
            .max(self.taken)
    }

    fn next_version(&self) -> u64 {
        self.latest_version() + 1
    }

    /// Validate, persist via `persist`, then append and swap.
    fn publish_with<F>(
        &self,
        mut artifact: ModelArtifact,
        versioning: Versioning,
        persist: F,
    ) -> Result<Arc<ModelArtifact>, ModelStoreError>
    where
        F: FnOnce(&ModelArtifact) -> Result<(), ModelStoreError>,
    {
        let _guard = self.publish.lock().map_err(|_| ModelStoreError::Poisoned)?;

        let latest = self.latest_version();
        if versioning == Versioning::Next {
            artifact.version = latest + 1;
        }
        if artifact.version <= latest {
            return Err(ModelStoreError::StaleVersion {
                current: latest,
                attempted: artifact.version,
            });
        }

        persist(&artifact)?;

        let artifact = Arc::new(artifact);
        self.history
            .write()
            .map_err(|_| ModelStoreError::Poisoned)?
            .push(artifact.clone());
        *self.current.write().map_err(|_| ModelStoreError::Poisoned)? = Some(artifact.clone());

        Ok(artifact)
    }
}

/// In-memory model store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryModelStore {
    log: ArtifactLog,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl ModelStore for InMemoryModelStore {
    fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.log.current()
    }

    fn publish(&self, artifact: ModelArtifact) -> Result<Arc<ModelArtifact>, ModelStoreError> {
        self.publish_as(artifact, Versioning::AsGiven)
    }

    fn publish_next(
        &self,
        artifact: ModelArtifact,
    ) -> Result<Arc<ModelArtifact>, ModelStoreError> {
        self.publish_as(artifact, Versioning::Next)
    }

    fn history(&self) -> Vec<Arc<ModelArtifact>> {
        self.log.history()
    }

    fn next_version(&self) -> u64 {
        self.log.next_version()
    }
}

impl InMemoryModelStore {
    fn publish_as(
        &self,
        artifact: ModelArtifact,
        versioning: Versioning,
    ) -> Result<Arc<ModelArtifact>, ModelStoreError> {
        let artifact = self.log.publish_with(artifact, versioning, |_| Ok(()))?;
        info!(version = artifact.version, "model artifact published");
        Ok(artifact)
    }
}

const ARTIFACTS_DIR: &str = "artifacts";
const CURRENT_FILE: &str = "CURRENT";

#[derive(Debug, Serialize, Deserialize)]
struct CurrentPointer {
    version: u64,
}

/// Directory-backed model store.
///
/// Layout:
/// - `artifacts/v{version:06}.json`: one file per artifact, never overwritten
/// - `CURRENT`: `{"version": n}`, replaced atomically (temp file + rename)
#[derive(Debug)]
pub struct FileModelStore {
    root: PathBuf,
    log: ArtifactLog,
}

impl FileModelStore {
    /// Open (or initialise) a store rooted at `root`.
    ///
    /// Unreadable artifacts are skipped and a missing or dangling `CURRENT`
    /// pointer leaves the store without a current model; both are logged and
    /// scoring falls back to the heuristic.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ModelStoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(ARTIFACTS_DIR)).map_err(io_err)?;

        let mut artifacts = Vec::new();
        let mut taken = 0;
        for entry in fs::read_dir(root.join(ARTIFACTS_DIR)).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // The file name reserves the version even when the body is bad.
            if let Some(v) = version_from_path(&path) {
                taken = taken.max(v);
            }
            match read_artifact(&path) {
                Ok(a) => artifacts.push(Arc::new(a)),
                Err(e) => warn!(error = %e, "skipping unreadable model artifact"),
            }
        }
        artifacts.sort_by_key(|a| a.version);

        let current = match read_pointer(&root.join(CURRENT_FILE)) {
            Ok(Some(version)) => {
                let found = artifacts.iter().find(|a| a.version == version).cloned();
                if found.is_none() {
                    warn!(version, "CURRENT points at a missing artifact; using fallback scoring");
                }
                found
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "CURRENT pointer unreadable; using fallback scoring");
                None
            }
        };

        info!(
            root = %root.display(),
            artifacts = artifacts.len(),
            current = current.as_ref().map(|a| a.version),
            "model store opened"
        );

        Ok(Self {
            root,
            log: ArtifactLog::seeded(artifacts, current, taken),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, version: u64) -> PathBuf {
        self.root
            .join(ARTIFACTS_DIR)
            .join(format!("v{version:06}.json"))
    }

    fn persist(&self, artifact: &ModelArtifact) -> Result<(), ModelStoreError> {
        let body = serde_json::to_vec_pretty(artifact)
            .map_err(|e| ModelStoreError::Serialization(e.to_string()))?;

        let path = self.artifact_path(artifact.version);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    ModelStoreError::AlreadyExists(artifact.version)
                }
                _ => io_err(e),
            })?;
        file.write_all(&body).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        let pointer = serde_json::to_vec(&CurrentPointer {
            version: artifact.version,
        })
        .map_err(|e| ModelStoreError::Serialization(e.to_string()))?;
        let tmp = self.root.join(format!("{CURRENT_FILE}.tmp"));
        fs::write(&tmp, pointer).map_err(io_err)?;
        fs::rename(&tmp, self.root.join(CURRENT_FILE)).map_err(io_err)?;
        Ok(())
    }
}

impl ModelStore for FileModelStore {
    fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.log.current()
    }

    fn publish(&self, artifact: ModelArtifact) -> Result<Arc<ModelArtifact>, ModelStoreError> {
        self.publish_as(artifact, Versioning::AsGiven)
    }

    fn publish_next(
        &self,
        artifact: ModelArtifact,
    ) -> Result<Arc<ModelArtifact>, ModelStoreError> {
        self.publish_as(artifact, Versioning::Next)
    }

    fn history(&self) -> Vec<Arc<ModelArtifact>> {
        self.log.history()
    }

    fn next_version(&self) -> u64 {
        self.log.next_version()
    }
}

impl FileModelStore {
    fn publish_as(
        &self,
        artifact: ModelArtifact,
        versioning: Versioning,
    ) -> Result<Arc<ModelArtifact>, ModelStoreError> {
        let artifact = self
            .log
            .publish_with(artifact, versioning, |a| self.persist(a))?;
        info!(
            version = artifact.version,
            root = %self.root.display(),
            "model artifact published"
        );
        Ok(artifact)
    }
}

/// `.../v000042.json` -> 42
fn version_from_path(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.strip_prefix('v')?.parse().ok()
}

fn read_artifact(path: &Path) -> Result<ModelArtifact, ModelLoadError> {
    let unreadable = |reason: String| ModelLoadError::Unreadable {
        path: path.display().to_string(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| unreadable(e.to_string()))
}

fn read_pointer(path: &Path) -> Result<Option<u64>, ModelLoadError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|e| ModelLoadError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let pointer: CurrentPointer =
        serde_json::from_slice(&bytes).map_err(|e| ModelLoadError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(Some(pointer.version))
}

fn io_err(e: std::io::Error) -> ModelStoreError {
    ModelStoreError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn artifact(version: u64) -> ModelArtifact {
        ModelArtifact::new(
            version,
            vec!["interaction_count".into()],
            json!({"weights": [1.0], "bias": 0.0, "means": [0.0], "scales": [1.0]}),
            Utc::now(),
            50,
        )
        .with_metric("accuracy", 0.8)
    }

    #[test]
    fn publish_then_publish_keeps_history_newest_first() {
        let store = InMemoryModelStore::new();
        assert!(store.current().is_none());
        assert_eq!(store.next_version(), 1);

        store.publish(artifact(1)).unwrap();
        store.publish(artifact(2)).unwrap();

        assert_eq!(store.current().unwrap().version, 2);
        let versions: Vec<u64> = store.history().iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![2, 1]);
        assert_eq!(store.next_version(), 3);
    }

    #[test]
    fn stale_versions_are_rejected_without_touching_current() {
        let store = InMemoryModelStore::new();
        store.publish(artifact(3)).unwrap();

        let err = store.publish(artifact(3)).unwrap_err();
        assert_eq!(
            err,
            ModelStoreError::StaleVersion {
                current: 3,
                attempted: 3
            }
        );
        assert_eq!(store.current().unwrap().version, 3);
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn readers_hold_their_snapshot_across_publish() {
        let store = InMemoryModelStore::new();
        store.publish(artifact(1)).unwrap();
        let held = store.current().unwrap();
        store.publish(artifact(2)).unwrap();
        assert_eq!(held.version, 1);
        assert_eq!(store.current().unwrap().version, 2);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileModelStore::open(dir.path()).unwrap();
            store.publish(artifact(1)).unwrap();
            store.publish(artifact(2)).unwrap();
        }

        let reopened = FileModelStore::open(dir.path()).unwrap();
        let current = reopened.current().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.metric("accuracy"), Some(0.8));
        assert_eq!(reopened.history().len(), 2);
        assert!(dir.path().join("artifacts/v000001.json").exists());
    }

    #[test]
    fn file_store_tolerates_corrupt_pointer() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileModelStore::open(dir.path()).unwrap();
            store.publish(artifact(1)).unwrap();
        }
        fs::write(dir.path().join(CURRENT_FILE), b"{not json").unwrap();

        let reopened = FileModelStore::open(dir.path()).unwrap();
        assert!(reopened.current().is_none());
        assert_eq!(reopened.history().len(), 1);
        // history still drives versioning, so the next publish does not collide
        assert_eq!(reopened.next_version(), 2);
        reopened.publish(artifact(2)).unwrap();
        assert_eq!(reopened.current().unwrap().version, 2);
    }

    #[test]
    fn file_store_skips_corrupt_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileModelStore::open(dir.path()).unwrap();
            store.publish(artifact(1)).unwrap();
        }
        fs::write(dir.path().join("artifacts/v000001.json"), b"garbage").unwrap();

        let reopened = FileModelStore::open(dir.path()).unwrap();
        assert!(reopened.current().is_none());
        assert!(reopened.history().is_empty());
    }

    #[test]
    fn corrupt_artifact_still_reserves_its_version() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileModelStore::open(dir.path()).unwrap();
            store.publish(artifact(1)).unwrap();
        }
        fs::write(dir.path().join("artifacts/v000001.json"), b"garbage").unwrap();

        let reopened = FileModelStore::open(dir.path()).unwrap();
        assert_eq!(reopened.next_version(), 2);
        assert!(matches!(
            reopened.publish(artifact(1)),
            Err(ModelStoreError::StaleVersion { current: 1, attempted: 1 })
        ));
        reopened.publish(artifact(reopened.next_version())).unwrap();
        assert_eq!(reopened.current().unwrap().version, 2);
        assert_eq!(reopened.publish_next(artifact(1)).unwrap().version, 3);
    }

    #[test]
    fn publish_next_ignores_the_carried_version() {
        let store = InMemoryModelStore::new();
        store.publish(artifact(1)).unwrap();

        // Built against a stale next_version().
        let published = store.publish_next(artifact(1)).unwrap();
        assert_eq!(published.version, 2);
        assert_eq!(store.current().unwrap().version, 2);
        assert_eq!(store.next_version(), 3);
    }
}
