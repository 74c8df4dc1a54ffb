//! Keyed blob storage for per-tranche coverage artifacts.
//!
//! Writes are keyed by run id and tranche index so no two workers ever
//! contend for the same key, within a run or across concurrent runs;
//! the store needs no locking on the write path beyond what the
//! backend itself requires.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::{CiError, Result};

/// Key prefix scoping one run's artifacts. Runs sharing a store never
/// read or clear outside their own prefix.
pub fn run_prefix(run_id: &str) -> String {
    format!("run-{run_id}-")
}

/// Artifact key for one tranche's coverage output within a run.
pub fn artifact_key(run_id: &str, index: usize) -> String {
    format!("{}coverage-tranche-{index}.lcov", run_prefix(run_id))
}

/// Keyed blob store for run artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous value.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Retrieve the blob for `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Fetch every artifact whose key starts with `prefix`, deduplicated
    /// by key and sorted by key.
    fn list_matching(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every artifact whose key starts with `prefix`. Used when a
    /// superseded run's partial output must not leak into later reports.
    fn clear_matching(&self, prefix: &str) -> Result<()>;
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("store mutex poisoned");
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().expect("store mutex poisoned");
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| CiError::ArtifactNotFound(key.to_string()))
    }

    fn list_matching(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let blobs = self.blobs.lock().expect("store mutex poisoned");
        Ok(blobs
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear_matching(&self, prefix: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("store mutex poisoned");
        blobs.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Filesystem-backed store. Keys map to file names under the root;
/// writes go through a temp file and rename so readers never observe a
/// partially written artifact.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| CiError::Io(e.error))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(key);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CiError::ArtifactNotFound(key.to_string())
            } else {
                CiError::Io(e)
            }
        })
    }

    fn list_matching(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut found = BTreeMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && entry.file_type()?.is_file() {
                found.insert(name, fs::read(entry.path())?);
            }
        }
        Ok(found.into_iter().collect())
    }

    fn clear_matching(&self, prefix: &str) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    const RUN: &str = "11111111-2222-3333-4444-555555555555";

    #[test]
    fn test_artifact_key_naming() {
        assert_eq!(
            artifact_key("r1", 0),
            "run-r1-coverage-tranche-0.lcov"
        );
        assert_eq!(
            artifact_key("r1", 3),
            "run-r1-coverage-tranche-3.lcov"
        );
        assert!(artifact_key(RUN, 7).starts_with(&run_prefix(RUN)));
    }

    #[test]
    fn test_keys_for_different_runs_never_collide() {
        assert!(!artifact_key("run-a", 0).starts_with(&run_prefix("run-b")));
        assert_ne!(artifact_key("run-a", 0), artifact_key("run-b", 0));
    }

    #[test]
    fn test_memory_put_get_roundtrip() {
        let store = MemoryArtifactStore::new();
        store.put(&artifact_key(RUN, 0), b"data").unwrap();
        assert_eq!(store.get(&artifact_key(RUN, 0)).unwrap(), b"data");
    }

    #[test]
    fn test_memory_get_missing_is_not_found() {
        let store = MemoryArtifactStore::new();
        match store.get("nope") {
            Err(CiError::ArtifactNotFound(key)) => assert_eq!(key, "nope"),
            other => panic!("expected ArtifactNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_memory_list_matching_sorted_and_filtered() {
        let store = MemoryArtifactStore::new();
        store.put(&artifact_key(RUN, 2), b"two").unwrap();
        store.put(&artifact_key(RUN, 0), b"zero").unwrap();
        store.put("unrelated.txt", b"x").unwrap();

        let found = store.list_matching(&run_prefix(RUN)).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, artifact_key(RUN, 0));
        assert_eq!(found[1].0, artifact_key(RUN, 2));
    }

    #[test]
    fn test_memory_put_replaces() {
        let store = MemoryArtifactStore::new();
        store.put("k", b"old").unwrap();
        store.put("k", b"new").unwrap();
        assert_eq!(store.get("k").unwrap(), b"new");
        assert_eq!(store.list_matching("k").unwrap().len(), 1, "dedup by key");
    }

    #[test]
    fn test_memory_clear_matching_scoped_to_run() {
        let store = MemoryArtifactStore::new();
        store.put(&artifact_key(RUN, 0), b"a").unwrap();
        store.put(&artifact_key(RUN, 1), b"b").unwrap();
        store.put(&artifact_key("other-run", 0), b"c").unwrap();

        store.clear_matching(&run_prefix(RUN)).unwrap();
        assert!(store.list_matching(&run_prefix(RUN)).unwrap().is_empty());
        assert_eq!(store.get(&artifact_key("other-run", 0)).unwrap(), b"c");
    }

    #[test]
    fn test_fs_put_get_roundtrip() {
        let (_dir, store) = fs_store();
        store.put(&artifact_key(RUN, 1), b"lcov bytes").unwrap();
        assert_eq!(store.get(&artifact_key(RUN, 1)).unwrap(), b"lcov bytes");
    }

    #[test]
    fn test_fs_get_missing_is_not_found() {
        let (_dir, store) = fs_store();
        assert!(matches!(
            store.get("absent"),
            Err(CiError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_fs_list_matching_ignores_other_files() {
        let (dir, store) = fs_store();
        store.put(&artifact_key(RUN, 0), b"a").unwrap();
        store.put(&artifact_key(RUN, 1), b"b").unwrap();
        std::fs::write(dir.path().join("report.md"), b"not coverage").unwrap();

        let found = store.list_matching(&run_prefix(RUN)).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, artifact_key(RUN, 0));
    }

    #[test]
    fn test_fs_clear_matching_removes_only_prefix() {
        let (dir, store) = fs_store();
        store.put(&artifact_key(RUN, 0), b"a").unwrap();
        store.put(&artifact_key("other-run", 0), b"keep").unwrap();
        std::fs::write(dir.path().join("report.md"), b"keep").unwrap();

        store.clear_matching(&run_prefix(RUN)).unwrap();
        assert!(store.list_matching(&run_prefix(RUN)).unwrap().is_empty());
        assert!(store.get(&artifact_key("other-run", 0)).is_ok());
        assert!(dir.path().join("report.md").exists());
    }
}
