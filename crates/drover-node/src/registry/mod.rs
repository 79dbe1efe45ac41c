//! # Registry contract
//!
//! The central registry owns build metadata and task lifecycles. The node
//! only talks to it through [`Registry`]; [`crate::client::RegistryClient`]
//! wraps an implementation and turns every failure into a default value.
//!
//! Two reference implementations ship with the node:
//! - [`MemoryRegistry`]: in-process, used by tests and embedding callers
//! - [`JsonRegistry`]: one `registry.json` document on a shared path

mod json;
mod memory;

pub use json::JsonRegistry;
pub use memory::MemoryRegistry;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use drover_cas::ContentHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type BuildId = i64;
pub type TaskId = i64;

/// One file of a platform build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the build's repository root
    pub path: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Assigned,
    InProgress,
    Finished,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Discovered,
    Ready,
    Deleted,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Registry document error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown build: {0}")]
    UnknownBuild(BuildId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Calls the node makes against the central registry.
pub trait Registry: Send + Sync {
    fn build_manifest(&self, build: BuildId) -> Result<Vec<ManifestEntry>>;

    fn repository_root(&self, build: BuildId) -> Result<PathBuf>;

    /// Platform tag used to pick an executor.
    fn build_platform(&self, build: BuildId) -> Result<String>;

    /// Whether any live build still lists `hash` in its manifest.
    fn content_hash_still_referenced(&self, hash: &ContentHash) -> Result<bool>;

    /// [`content_hash_still_referenced`](Self::content_hash_still_referenced)
    /// for a whole sample, answers in input order.
    fn hashes_still_referenced(&self, hashes: &[ContentHash]) -> Result<Vec<bool>> {
        hashes
            .iter()
            .map(|hash| self.content_hash_still_referenced(hash))
            .collect()
    }

    /// Newest Ready builds first.
    fn recent_ready_builds(&self, limit: usize) -> Result<Vec<BuildId>>;

    fn assigned_task(&self, node: &str) -> Result<Option<TaskId>>;

    fn resolve_task_build(&self, task: TaskId) -> Result<Option<BuildId>>;

    fn task_destination(&self, task: TaskId) -> Result<Option<PathBuf>>;

    /// Returns `false` when the task was canceled externally.
    fn update_task_status(
        &self,
        task: TaskId,
        status: TaskStatus,
        progress: u8,
        error: &str,
    ) -> Result<bool>;

    /// Tasks currently in progress on any node.
    fn active_task_count(&self) -> Result<u64>;
}

/// A registered platform build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildId,
    pub project: String,
    pub platform: String,
    pub status: BuildStatus,
    pub repository_root: PathBuf,
    pub discovered_at: DateTime<Utc>,
    /// Stands for the newest Ready build of the same project and platform
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
}

impl BuildRecord {
    pub fn new(
        id: BuildId,
        project: impl Into<String>,
        platform: impl Into<String>,
        repository_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            project: project.into(),
            platform: platform.into(),
            status: BuildStatus::Ready,
            repository_root: repository_root.into(),
            discovered_at: Utc::now(),
            latest: false,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, hash: ContentHash, size: u64) -> Self {
        self.files.push(ManifestEntry {
            path: path.into(),
            hash,
            size,
        });
        self
    }

    pub fn discovered_at(mut self, at: DateTime<Utc>) -> Self {
        self.discovered_at = at;
        self
    }

    pub fn with_status(mut self, status: BuildStatus) -> Self {
        self.status = status;
        self
    }

    /// Alias record that resolves to the newest Ready build.
    pub fn latest_alias(mut self) -> Self {
        self.latest = true;
        self
    }
}

/// A delivery assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub build: BuildId,
    #[serde(default)]
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A task already assigned to `node`.
    pub fn assigned(id: TaskId, build: BuildId, node: impl Into<String>) -> Self {
        Self {
            id,
            build,
            assigned_to: Some(node.into()),
            status: TaskStatus::Assigned,
            progress: 0,
            error: String::new(),
            destination: None,
            completed_at: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Apply a status report from a node.
    ///
    /// A task canceled by the registry refuses further updates. A cancel on a
    /// task that is neither scheduled nor running keeps its current status.
    pub fn apply_update(&mut self, status: TaskStatus, progress: u8, error: &str) -> bool {
        if self.status == TaskStatus::Canceled {
            return false;
        }

        let status = if status == TaskStatus::Canceled
            && !matches!(self.status, TaskStatus::InProgress | TaskStatus::Scheduled)
        {
            self.status
        } else {
            status
        };

        self.status = status;
        self.error = error.to_string();
        if matches!(status, TaskStatus::Finished | TaskStatus::Canceled) {
            self.progress = 100;
            self.completed_at = Some(Utc::now());
        } else {
            self.progress = progress.min(100);
        }
        true
    }
}

/// Registry contents shared by the reference implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryData {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub builds: Vec<BuildRecord>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

const REGISTRY_VERSION: u32 = 1;

fn default_version() -> u32 {
    REGISTRY_VERSION
}

impl Default for RegistryData {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            builds: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl RegistryData {
    fn build(&self, id: BuildId) -> Result<&BuildRecord> {
        self.builds
            .iter()
            .find(|b| b.id == id)
            .ok_or(RegistryError::UnknownBuild(id))
    }

    fn task(&self, id: TaskId) -> Result<&TaskRecord> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or(RegistryError::UnknownTask(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(RegistryError::UnknownTask(id))
    }

    fn manifest(&self, build: BuildId) -> Result<Vec<ManifestEntry>> {
        Ok(self.build(build)?.files.clone())
    }

    fn repository_root(&self, build: BuildId) -> Result<PathBuf> {
        Ok(self.build(build)?.repository_root.clone())
    }

    fn platform(&self, build: BuildId) -> Result<String> {
        Ok(self.build(build)?.platform.clone())
    }

    fn referenced_set(&self) -> HashSet<ContentHash> {
        self.builds
            .iter()
            .filter(|b| b.status != BuildStatus::Deleted)
            .flat_map(|b| b.files.iter().map(|f| f.hash))
            .collect()
    }

    fn referenced(&self, hash: &ContentHash) -> bool {
        self.builds
            .iter()
            .filter(|b| b.status != BuildStatus::Deleted)
            .any(|b| b.files.iter().any(|f| f.hash == *hash))
    }

    fn ready_builds_newest_first(&self) -> Vec<&BuildRecord> {
        let mut ready: Vec<_> = self
            .builds
            .iter()
            .filter(|b| b.status == BuildStatus::Ready && !b.latest)
            .collect();
        ready.sort_by(|a, b| {
            b.discovered_at
                .cmp(&a.discovered_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        ready
    }

    fn recent_ready(&self, limit: usize) -> Vec<BuildId> {
        self.ready_builds_newest_first()
            .into_iter()
            .take(limit)
            .map(|b| b.id)
            .collect()
    }

    fn assigned_task(&self, node: &str) -> Option<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Assigned && t.assigned_to.as_deref() == Some(node))
            .map(|t| t.id)
            .min()
    }

    fn resolve_task_build(&self, task: TaskId) -> Result<Option<BuildId>> {
        let task = self.task(task)?;
        let Ok(build) = self.build(task.build) else {
            return Ok(None);
        };
        if !build.latest {
            return Ok(Some(build.id));
        }
        Ok(self
            .ready_builds_newest_first()
            .into_iter()
            .find(|b| b.project == build.project && b.platform == build.platform)
            .map(|b| b.id))
    }

    fn destination(&self, task: TaskId) -> Result<Option<PathBuf>> {
        Ok(self.task(task)?.destination.clone())
    }

    fn update_task(
        &mut self,
        task: TaskId,
        status: TaskStatus,
        progress: u8,
        error: &str,
    ) -> Result<bool> {
        Ok(self.task_mut(task)?.apply_update(status, progress, error))
    }

    fn active_tasks(&self) -> u64 {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count() as u64
    }
}
