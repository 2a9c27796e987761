use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cached facts about one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Absolute repository path; also the map key.
    pub repo_path: String,
    pub default_branch: String,
    /// Unix seconds of the last write.
    pub last_updated: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RepoConfigError {
    #[error("repository cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository cache is corrupt: {0}")]
    Parse(#[from] serde_json::Error),
}

/// JSON file mapping absolute repository path to [`RepoConfig`].
///
/// Reads and writes are serialised through an in-process mutex; writes go
/// through a temp file and rename.
#[derive(Debug)]
pub struct RepoConfigStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl RepoConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, repo: &Path) -> Result<Option<RepoConfig>, RepoConfigError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_all()?.remove(&repo_key(repo)))
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, RepoConfig>, RepoConfigError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_all()
    }

    /// Record the default branch for `repo`, stamping the update time.
    pub fn save_default_branch(
        &self,
        repo: &Path,
        default_branch: &str,
    ) -> Result<RepoConfig, RepoConfigError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read_all()?;
        let key = repo_key(repo);
        let record = RepoConfig {
            repo_path: key.clone(),
            default_branch: default_branch.to_string(),
            last_updated: Utc::now().timestamp(),
        };
        all.insert(key, record.clone());
        self.write_all(&all)?;
        debug!(repo = %record.repo_path, branch = %record.default_branch, "cached default branch");
        Ok(record)
    }

    /// Drop the cached record for one repository. Returns whether one existed.
    pub fn delete(&self, repo: &Path) -> Result<bool, RepoConfigError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read_all()?;
        let existed = all.remove(&repo_key(repo)).is_some();
        if existed {
            self.write_all(&all)?;
        }
        Ok(existed)
    }

    /// Remove the cache file entirely.
    pub fn delete_all(&self) -> Result<(), RepoConfigError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, RepoConfig>, RepoConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, all: &BTreeMap<String, RepoConfig>) -> Result<(), RepoConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(all)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Absolute path string used as the cache key.
pub fn repo_key(repo: &Path) -> String {
    repo.canonicalize()
        .unwrap_or_else(|_| repo.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoConfigStore::new(tmp.path().join("repos.json"));
        assert!(store.load(tmp.path()).unwrap().is_none());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoConfigStore::new(tmp.path().join("repos.json"));
        let saved = store.save_default_branch(tmp.path(), "main").unwrap();
        assert!(saved.last_updated > 0);

        let loaded = store.load(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded.default_branch, "main");
        assert_eq!(loaded.repo_path, repo_key(tmp.path()));
    }

    #[test]
    fn delete_and_delete_all() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_a = tmp.path().join("a");
        let repo_b = tmp.path().join("b");
        std::fs::create_dir_all(&repo_a).unwrap();
        std::fs::create_dir_all(&repo_b).unwrap();
        let store = RepoConfigStore::new(tmp.path().join("repos.json"));
        store.save_default_branch(&repo_a, "main").unwrap();
        store.save_default_branch(&repo_b, "trunk").unwrap();

        assert!(store.delete(&repo_a).unwrap());
        assert!(!store.delete(&repo_a).unwrap());
        assert_eq!(store.load_all().unwrap().len(), 1);

        store.delete_all().unwrap();
        assert!(!store.path().exists());
        store.delete_all().unwrap();
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repos.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = RepoConfigStore::new(path);
        assert!(matches!(
            store.load(tmp.path()),
            Err(RepoConfigError::Parse(_))
        ));
    }
}
