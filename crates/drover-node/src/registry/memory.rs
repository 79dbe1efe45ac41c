use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use drover_cas::ContentHash;

use super::{
    BuildId, BuildRecord, ManifestEntry, Registry, RegistryData, RegistryError, Result,
    TaskId, TaskRecord, TaskStatus,
};

/// In-process registry.
///
/// Backs tests and embedders that feed build metadata from elsewhere. Can be
/// switched offline to simulate an unreachable registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    data: Mutex<RegistryData>,
    offline: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build(self, build: BuildRecord) -> Self {
        self.insert_build(build);
        self
    }

    pub fn with_task(self, task: TaskRecord) -> Self {
        self.insert_task(task);
        self
    }

    /// Insert or replace a build.
    pub fn insert_build(&self, build: BuildRecord) {
        let mut data = self.lock();
        data.builds.retain(|b| b.id != build.id);
        data.builds.push(build);
    }

    /// Insert or replace a task.
    pub fn insert_task(&self, task: TaskRecord) {
        let mut data = self.lock();
        data.tasks.retain(|t| t.id != task.id);
        data.tasks.push(task);
    }

    pub fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.lock().tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Cancel a task from the registry side.
    pub fn cancel_task(&self, id: TaskId) {
        if let Some(task) = self.lock().tasks.iter_mut().find(|t| t.id == id) {
            task.status = TaskStatus::Canceled;
        }
    }

    /// While offline every call fails with [`RegistryError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn online(&self) -> Result<MutexGuard<'_, RegistryData>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry offline".into()));
        }
        Ok(self.lock())
    }
}

impl Registry for MemoryRegistry {
    fn build_manifest(&self, build: BuildId) -> Result<Vec<ManifestEntry>> {
        self.online()?.manifest(build)
    }

    fn repository_root(&self, build: BuildId) -> Result<PathBuf> {
        self.online()?.repository_root(build)
    }

    fn build_platform(&self, build: BuildId) -> Result<String> {
        self.online()?.platform(build)
    }

    fn content_hash_still_referenced(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.online()?.referenced(hash))
    }

    fn recent_ready_builds(&self, limit: usize) -> Result<Vec<BuildId>> {
        Ok(self.online()?.recent_ready(limit))
    }

    fn assigned_task(&self, node: &str) -> Result<Option<TaskId>> {
        Ok(self.online()?.assigned_task(node))
    }

    fn resolve_task_build(&self, task: TaskId) -> Result<Option<BuildId>> {
        self.online()?.resolve_task_build(task)
    }

    fn task_destination(&self, task: TaskId) -> Result<Option<PathBuf>> {
        self.online()?.destination(task)
    }

    fn update_task_status(
        &self,
        task: TaskId,
        status: TaskStatus,
        progress: u8,
        error: &str,
    ) -> Result<bool> {
        self.online()?.update_task(task, status, progress, error)
    }

    fn active_task_count(&self) -> Result<u64> {
        Ok(self.online()?.active_tasks())
    }
}
