use async_trait::async_trait;
use drover_core::{DroverError, DroverResult, WorkItem, WorkItemStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Source of work items and sink for their status changes.
///
/// Creating and deleting items happens elsewhere; the scheduler only reads
/// them and moves their status.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Every item of a project, across all branches.
    async fn list(&self, project: &Path) -> DroverResult<Vec<WorkItem>>;

    async fn get(&self, id: &str) -> DroverResult<Option<WorkItem>>;

    /// Move an item to `status`. Backward moves other than a reset to
    /// pending are rejected with [`DroverError::Store`].
    async fn update_status(&self, id: &str, status: WorkItemStatus) -> DroverResult<WorkItem>;
}

fn apply_transition(item: &mut WorkItem, status: WorkItemStatus) -> DroverResult<()> {
    if !item.can_transition_to(status) {
        return Err(DroverError::Store(format!(
            "work item '{}' cannot move from {} to {}",
            item.id, item.status, status
        )));
    }
    item.status = status;
    Ok(())
}

/// Items held in memory, grouped by project.
#[derive(Default)]
pub struct InMemoryWorkItemStore {
    projects: RwLock<HashMap<PathBuf, Vec<WorkItem>>>,
}

impl InMemoryWorkItemStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with one project's items.
    pub fn with_items(project: impl Into<PathBuf>, items: Vec<WorkItem>) -> Self {
        let store = Self::new();
        store.projects.write().insert(project.into(), items);
        store
    }

    /// Add or replace an item.
    pub fn upsert(&self, project: impl Into<PathBuf>, item: WorkItem) {
        let mut projects = self.projects.write();
        let items = projects.entry(project.into()).or_default();
        match items.iter_mut().find(|w| w.id == item.id) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
    }

    /// Current status of an item, without going through the async trait.
    pub fn status_of(&self, id: &str) -> Option<WorkItemStatus> {
        self.projects
            .read()
            .values()
            .flatten()
            .find(|w| w.id == id)
            .map(|w| w.status)
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn list(&self, project: &Path) -> DroverResult<Vec<WorkItem>> {
        Ok(self.projects.read().get(project).cloned().unwrap_or_default())
    }

    async fn get(&self, id: &str) -> DroverResult<Option<WorkItem>> {
        Ok(self
            .projects
            .read()
            .values()
            .flatten()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn update_status(&self, id: &str, status: WorkItemStatus) -> DroverResult<WorkItem> {
        let mut projects = self.projects.write();
        let item = projects
            .values_mut()
            .flatten()
            .find(|w| w.id == id)
            .ok_or_else(|| DroverError::Store(format!("work item '{id}' not found")))?;
        apply_transition(item, status)?;
        Ok(item.clone())
    }
}

/// Items of a single project kept as a JSON array in one file.
///
/// Every call re-reads the file, so edits made by other tools between polls
/// are picked up. Writes go through a temp file and a rename.
pub struct JsonFileWorkItemStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileWorkItemStore {
    /// Store backed by the JSON array at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> DroverResult<Vec<WorkItem>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(Vec::new()),
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                DroverError::Store(format!("Failed to parse {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, items: &[WorkItem]) -> DroverResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(items)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkItemStore for JsonFileWorkItemStore {
    async fn list(&self, _project: &Path) -> DroverResult<Vec<WorkItem>> {
        self.read_all().await
    }

    async fn get(&self, id: &str) -> DroverResult<Option<WorkItem>> {
        Ok(self.read_all().await?.into_iter().find(|w| w.id == id))
    }

    async fn update_status(&self, id: &str, status: WorkItemStatus) -> DroverResult<WorkItem> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.read_all().await?;
        let item = items
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| DroverError::Store(format!("work item '{id}' not found")))?;
        apply_transition(item, status)?;
        let updated = item.clone();
        self.write_all(&items).await?;
        debug!(work_item_id = %id, status = %status, "status written");
        Ok(updated)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_lists_by_project() {
        let store = InMemoryWorkItemStore::with_items("/a", vec![WorkItem::new("1", "one")]);
        store.upsert("/b", WorkItem::new("2", "two"));
        assert_eq!(store.list(Path::new("/a")).await.unwrap().len(), 1);
        assert_eq!(store.list(Path::new("/b")).await.unwrap()[0].id, "2");
        assert!(store.list(Path::new("/c")).await.unwrap().is_empty());
        assert!(store.get("2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_in_memory_rejects_backward_transition() {
        let store = InMemoryWorkItemStore::with_items("/a", vec![WorkItem::new("1", "one")]);
        store.update_status("1", WorkItemStatus::Running).await.unwrap();
        store.update_status("1", WorkItemStatus::Completed).await.unwrap();
        let err = store.update_status("1", WorkItemStatus::Running).await.unwrap_err();
        assert!(matches!(err, DroverError::Store(_)));
        store.update_status("1", WorkItemStatus::Pending).await.unwrap();
        assert_eq!(store.status_of("1"), Some(WorkItemStatus::Pending));
    }

    #[tokio::test]
    async fn test_in_memory_unknown_id() {
        let store = InMemoryWorkItemStore::new();
        assert!(store.update_status("x", WorkItemStatus::Running).await.is_err());
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","title":"A","status":"pending"},{"id":"b","title":"B","status":"pending","dependencies":["a"]}]"#,
        )
        .unwrap();
        let store = JsonFileWorkItemStore::new(&path);
        assert_eq!(store.list(dir.path()).await.unwrap().len(), 2);

        store.update_status("a", WorkItemStatus::Running).await.unwrap();
        let reopened = JsonFileWorkItemStore::new(&path);
        let a = reopened.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, WorkItemStatus::Running);
        assert_eq!(reopened.get("b").await.unwrap().unwrap().dependencies, vec!["a"]);
    }

    #[tokio::test]
    async fn test_json_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileWorkItemStore::new(dir.path().join("none.json"));
        assert!(store.list(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_corrupt_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(&path, "[{").unwrap();
        let err = JsonFileWorkItemStore::new(&path).list(dir.path()).await.unwrap_err();
        assert!(matches!(err, DroverError::Store(_)));
    }
}
