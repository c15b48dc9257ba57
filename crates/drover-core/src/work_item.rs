use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting to be scheduled.
    Pending,
    /// Currently dispatched to a provider.
    Running,
    /// The agent finished successfully.
    Completed,
    /// The dispatch failed.
    Failed,
    /// A completed item that has been approved externally.
    Verified,
}

impl WorkItemStatus {
    /// Position in the forward lifecycle; `Failed` sits beside `Completed`.
    fn rank(self) -> u8 {
        match self {
            WorkItemStatus::Pending => 0,
            WorkItemStatus::Running => 1,
            WorkItemStatus::Completed | WorkItemStatus::Failed => 2,
            WorkItemStatus::Verified => 3,
        }
    }

    /// Whether a dependency in this status counts as met.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, WorkItemStatus::Completed | WorkItemStatus::Verified)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemStatus::Pending => write!(f, "pending"),
            WorkItemStatus::Running => write!(f, "running"),
            WorkItemStatus::Completed => write!(f, "completed"),
            WorkItemStatus::Failed => write!(f, "failed"),
            WorkItemStatus::Verified => write!(f, "verified"),
        }
    }
}

fn default_priority() -> u8 {
    2
}

/// A schedulable unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier within the store.
    pub id: String,
    /// One-line summary; the first line of the prompt.
    pub title: String,
    /// Body of the prompt, appended after the title.
    #[serde(default)]
    pub description: String,
    /// Lifecycle position.
    pub status: WorkItemStatus,
    /// Ids of items that must complete before this one is admitted.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Target branch; `None` means the project's main checkout.
    #[serde(default)]
    pub branch: Option<String>,
    /// Model identifier, possibly carrying a provider prefix.
    #[serde(default)]
    pub model: Option<String>,
    /// Lower values are scheduled first among equally-ready items.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Directory to run the agent in instead of the project root.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl WorkItem {
    /// A pending item with default priority and no dependencies.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: WorkItemStatus::Pending,
            dependencies: Vec::new(),
            branch: None,
            model: None,
            priority: default_priority(),
            workspace: None,
        }
    }

    /// Set the prompt body.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replace the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Scope the item to a branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Pin the model, overriding the scheduler default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the status directly, bypassing transition checks.
    pub fn with_status(mut self, status: WorkItemStatus) -> Self {
        self.status = status;
        self
    }

    /// Status moves only forward, except an explicit reset to pending.
    /// `Failed` may only be left through that reset.
    pub fn can_transition_to(&self, next: WorkItemStatus) -> bool {
        if next == WorkItemStatus::Pending || next == self.status {
            return true;
        }
        if self.status == WorkItemStatus::Failed {
            return false;
        }
        if next == WorkItemStatus::Verified {
            return self.status == WorkItemStatus::Completed;
        }
        next.rank() > self.status.rank()
    }

    /// Whether this item belongs to the given branch scope.
    pub fn in_branch(&self, branch: Option<&str>) -> bool {
        self.branch.as_deref() == branch
    }
}

/// The grouping under which concurrency and failure limits are tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    /// Project root on disk.
    pub project: PathBuf,
    /// Optional branch within the project.
    #[serde(default)]
    pub branch: Option<String>,
}

impl Scope {
    /// The project's main checkout.
    pub fn new(project: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            branch: None,
        }
    }

    /// A branch within the project.
    pub fn with_branch(project: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            branch: Some(branch.into()),
        }
    }

    /// Stable textual key, used for hashing and log fields.
    pub fn key(&self) -> String {
        match &self.branch {
            Some(b) => format!("{}@{}", self.project.display(), b),
            None => self.project.display().to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
