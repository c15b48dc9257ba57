use chrono::{DateTime, Utc};
use drover_core::{DroverError, DroverResult, Scope};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted record of a loop's running set, used for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStateSnapshot {
    /// Format version.
    pub version: u32,
    /// Whether the loop was running when saved.
    pub auto_loop_running: bool,
    /// Ceiling to restart with.
    pub max_concurrency: usize,
    /// Scope project.
    pub project_path: PathBuf,
    /// Scope branch.
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Items in flight when saved.
    #[serde(default)]
    pub running_work_item_ids: Vec<String>,
    /// Write time.
    pub saved_at: DateTime<Utc>,
    /// Last provider session per work item, for resuming after a restart.
    #[serde(default)]
    pub session_ids: HashMap<String, String>,
}

impl ExecutionStateSnapshot {
    /// Empty running snapshot for `scope`.
    pub fn new(scope: &Scope, max_concurrency: usize) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            auto_loop_running: true,
            max_concurrency,
            project_path: scope.project.clone(),
            branch_name: scope.branch.clone(),
            running_work_item_ids: Vec::new(),
            saved_at: Utc::now(),
            session_ids: HashMap::new(),
        }
    }

    /// Scope the snapshot belongs to.
    pub fn scope(&self) -> Scope {
        Scope {
            project: self.project_path.clone(),
            branch: self.branch_name.clone(),
        }
    }
}

/// JSON snapshot files, one per scope, under a state directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Store writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory snapshots are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `execution-state-<first 12 hex chars of sha256(scope key)>.json`
    pub fn path_for(&self, scope: &Scope) -> PathBuf {
        let digest = Sha256::digest(scope.key().as_bytes());
        let hash = hex::encode(digest);
        self.dir.join(format!("execution-state-{}.json", &hash[..12]))
    }

    /// Write atomically: a temp file, then rename over the target.
    pub async fn save(&self, snapshot: &ExecutionStateSnapshot) -> DroverResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&snapshot.scope());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), running = snapshot.running_work_item_ids.len(), "snapshot saved");
        Ok(())
    }

    /// Snapshot for `scope`, if one was saved.
    pub async fn load(&self, scope: &Scope) -> DroverResult<Option<ExecutionStateSnapshot>> {
        let path = self.path_for(scope);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let snapshot = serde_json::from_str(&data).map_err(|e| {
            DroverError::Snapshot(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(snapshot))
    }

    /// Every readable snapshot; unparsable files are skipped with a warning.
    pub async fn load_all(&self) -> DroverResult<Vec<ExecutionStateSnapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with("execution-state-") && name.ends_with(".json")) {
                continue;
            }
            let path = entry.path();
            let data = match tokio::fs::read_to_string(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                    continue;
                }
            };
            match serde_json::from_str::<ExecutionStateSnapshot>(&data) {
                Ok(s) if s.version == SNAPSHOT_VERSION => snapshots.push(s),
                Ok(s) => warn!(path = %path.display(), version = s.version, "skipping snapshot with unknown version"),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt snapshot"),
            }
        }
        snapshots.sort_by(|a, b| a.project_path.cmp(&b.project_path).then(a.branch_name.cmp(&b.branch_name)));
        Ok(snapshots)
    }

    /// Remove the scope's snapshot; missing files are fine.
    pub async fn clear(&self, scope: &Scope) -> DroverResult<()> {
        let path = self.path_for(scope);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let scope = Scope::with_branch("/repo", "feat/x");
        let mut snap = ExecutionStateSnapshot::new(&scope, 2);
        snap.running_work_item_ids = vec!["a".into()];
        snap.session_ids.insert("a".into(), "sess-1".into());

        store.save(&snap).await.unwrap();
        let loaded = store.load(&scope).await.unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert!(store.load(&Scope::new("/repo")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_on_disk_fields_are_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let scope = Scope::new("/repo");
        store.save(&ExecutionStateSnapshot::new(&scope, 1)).await.unwrap();
        let raw = std::fs::read_to_string(store.path_for(&scope)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["autoLoopRunning"], true);
        assert_eq!(value["maxConcurrency"], 1);
        assert!(value.get("runningWorkItemIds").is_some());
    }

    #[test]
    fn test_path_uses_scope_hash() {
        let store = SnapshotStore::new("/state");
        let a = store.path_for(&Scope::new("/repo"));
        let b = store.path_for(&Scope::with_branch("/repo", "main"));
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("execution-state-"));
        assert_eq!(name.len(), "execution-state-".len() + 12 + ".json".len());
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&ExecutionStateSnapshot::new(&Scope::new("/a"), 1)).await.unwrap();
        store.save(&ExecutionStateSnapshot::new(&Scope::new("/b"), 1)).await.unwrap();
        std::fs::write(dir.path().join("execution-state-deadbeef0000.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("unrelated.json"), "{}").unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].project_path, PathBuf::from("/a"));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let scope = Scope::new("/a");
        store.save(&ExecutionStateSnapshot::new(&scope, 1)).await.unwrap();
        store.clear(&scope).await.unwrap();
        store.clear(&scope).await.unwrap();
        assert!(store.load(&scope).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_all_missing_dir_is_empty() {
        let store = SnapshotStore::new("/nonexistent/drover-state-test");
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
