use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use af_core::worktree::{DiffStats, Worktree};
use af_session::tmux::session_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state_machine::InstanceStatus;

/// Most instances a store will hold.
pub const MAX_INSTANCES: usize = 10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything needed to rebuild an instance after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub title: String,
    pub repo_path: PathBuf,
    pub branch: String,
    pub program: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub auto_yes: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Absent for instances that were never started.
    #[serde(default)]
    pub worktree: Option<Worktree>,
    #[serde(default)]
    pub diff_stats: DiffStats,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("an instance titled '{0}' already exists")]
    TitleTaken(String),

    #[error("branch '{0}' is already used by another instance")]
    BranchTaken(String),

    #[error("'{title}' maps to tmux session '{session}', already used by '{owner}'")]
    SessionTaken {
        title: String,
        session: String,
        owner: String,
    },

    #[error("instance limit reached ({0})")]
    Full(usize),
}

// ---------------------------------------------------------------------------
// InstanceStore
// ---------------------------------------------------------------------------

/// Ordered instance list in a single JSON file (`{"instances": [...]}`).
///
/// Writes go to a sibling temp file that is renamed into place, so a crash
/// mid-write leaves the previous list intact.
pub struct InstanceStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl InstanceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, in insertion order. A missing file is an empty list.
    pub fn load(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    /// Replace the stored list.
    pub fn save(&self, records: &[InstanceRecord]) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(records)
    }

    /// Insert or replace the record with the same title.
    pub fn upsert(&self, record: InstanceRecord) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.read()?;
        match records.iter_mut().find(|r| r.title == record.title) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.write(&records)
    }

    /// Remove the record titled `title`. Returns whether one existed.
    pub fn delete(&self, title: &str) -> Result<bool, StoreError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.read()?;
        let before = records.len();
        records.retain(|r| r.title != title);
        if records.len() == before {
            return Ok(false);
        }
        self.write(&records)?;
        debug!(title, "instance record deleted");
        Ok(true)
    }

    pub fn delete_all(&self) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(&[])
    }

    /// Reject a new instance whose title, branch or tmux session name
    /// collides with a stored one, or that would exceed [`MAX_INSTANCES`].
    pub fn check_available(&self, title: &str, branch: &str) -> Result<(), StoreError> {
        let records = self.load()?;
        if records.iter().any(|r| r.title == title) {
            return Err(StoreError::TitleTaken(title.to_string()));
        }
        if records.iter().any(|r| r.branch == branch) {
            return Err(StoreError::BranchTaken(branch.to_string()));
        }
        let session = session_name(title);
        if let Some(owner) = records.iter().find(|r| session_name(&r.title) == session) {
            return Err(StoreError::SessionTaken {
                title: title.to_string(),
                session,
                owner: owner.title.clone(),
            });
        }
        if records.len() >= MAX_INSTANCES {
            return Err(StoreError::Full(MAX_INSTANCES));
        }
        Ok(())
    }

    fn read(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let state: StateFile =
            serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(state.instances)
    }

    fn write(&self, records: &[InstanceRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = StateFile {
            instances: records.to_vec(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            title: title.into(),
            repo_path: PathBuf::from("/repo"),
            branch: format!("alice/{title}"),
            program: "claude".into(),
            status: InstanceStatus::Running,
            auto_yes: false,
            created_at: now,
            updated_at: now,
            worktree: None,
            diff_stats: DiffStats::default(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(tmp.path().join("state.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_load_preserves_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(tmp.path().join("state.json"));
        store.save(&[record("b"), record("a")]).unwrap();
        let titles: Vec<_> = store.load().unwrap().into_iter().map(|r| r.title).collect();
        assert_eq!(titles, vec!["b", "a"]);
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn file_shape_is_an_instances_object() {
        let tmp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(tmp.path().join("state.json"));
        store.save(&[record("a")]).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["instances"][0]["title"], "a");
        assert_eq!(raw["instances"][0]["status"], "running");
    }

    #[test]
    fn upsert_replaces_by_title() {
        let tmp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(tmp.path().join("state.json"));
        store.upsert(record("a")).unwrap();
        let mut paused = record("a");
        paused.status = InstanceStatus::Paused;
        store.upsert(paused).unwrap();
        store.upsert(record("b")).unwrap();

        let all = store.load().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, InstanceStatus::Paused);
    }

    #[test]
    fn delete_and_delete_all() {
        let tmp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(tmp.path().join("state.json"));
        store.save(&[record("a"), record("b")]).unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.load().unwrap().len(), 1);
        store.delete_all().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_state_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{\"instances\": [ {").unwrap();
        let store = InstanceStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn availability_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(tmp.path().join("state.json"));
        store.save(&[record("a")]).unwrap();

        assert!(matches!(
            store.check_available("a", "alice/other"),
            Err(StoreError::TitleTaken(_))
        ));
        assert!(matches!(
            store.check_available("other", "alice/a"),
            Err(StoreError::BranchTaken(_))
        ));
        store.check_available("c", "alice/c").unwrap();

        let many: Vec<_> = (0..MAX_INSTANCES).map(|i| record(&format!("t{i}"))).collect();
        store.save(&many).unwrap();
        assert!(matches!(
            store.check_available("new", "alice/new"),
            Err(StoreError::Full(MAX_INSTANCES))
        ));
    }

    #[test]
    fn titles_sharing_a_session_name_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(tmp.path().join("state.json"));
        store.save(&[record("a b")]).unwrap();

        for title in ["a.b", "a_b", "a\tb"] {
            match store.check_available(title, &format!("alice/{title}-x")) {
                Err(StoreError::SessionTaken { session, owner, .. }) => {
                    assert_eq!(session, "af_a_b");
                    assert_eq!(owner, "a b");
                }
                other => panic!("{title}: expected SessionTaken, got {other:?}"),
            }
        }
        store.check_available("ab", "alice/ab").unwrap();
    }
}
