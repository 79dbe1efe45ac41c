//! Fail-closed access to the registry.
//!
//! Loops never see a registry error: each call logs the failure at `warn`
//! and hands back the default for its type (empty, `None`, `0`, `false`).
//!
//! Note the cost of the `false` default on `content_hash_still_referenced`:
//! during an outage, sampled blobs look unreferenced and are scheduled for
//! removal. Maintenance only reclaims when the registry also reports zero
//! active tasks, which an unreachable registry does through the same
//! default, so an outage during an idle period can drop cached content that
//! will later have to be fetched again.

use std::path::PathBuf;
use std::sync::Arc;

use drover_cas::ContentHash;
use drover_config::log_node_warn;

use crate::registry::{BuildId, ManifestEntry, Registry, RegistryError, TaskId, TaskStatus};

#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<dyn Registry>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient").finish_non_exhaustive()
    }
}

fn fail_closed<T: Default>(call: &'static str, result: Result<T, RegistryError>) -> T {
    result.unwrap_or_else(|e| {
        log_node_warn!(call, error = %e, "Registry call failed, using default");
        T::default()
    })
}

impl RegistryClient {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { inner: registry }
    }

    pub fn build_manifest(&self, build: BuildId) -> Vec<ManifestEntry> {
        fail_closed("build_manifest", self.inner.build_manifest(build))
    }

    pub fn repository_root(&self, build: BuildId) -> PathBuf {
        fail_closed("repository_root", self.inner.repository_root(build))
    }

    pub fn build_platform(&self, build: BuildId) -> String {
        fail_closed("build_platform", self.inner.build_platform(build))
    }

    pub fn content_hash_still_referenced(&self, hash: &ContentHash) -> bool {
        fail_closed(
            "content_hash_still_referenced",
            self.inner.content_hash_still_referenced(hash),
        )
    }

    /// One answer per hash; all `false` when the registry fails.
    pub fn hashes_still_referenced(&self, hashes: &[ContentHash]) -> Vec<bool> {
        self.inner
            .hashes_still_referenced(hashes)
            .unwrap_or_else(|e| {
                log_node_warn!(
                    call = "hashes_still_referenced",
                    error = %e,
                    "Registry call failed, using default"
                );
                vec![false; hashes.len()]
            })
    }

    pub fn recent_ready_builds(&self, limit: usize) -> Vec<BuildId> {
        fail_closed("recent_ready_builds", self.inner.recent_ready_builds(limit))
    }

    pub fn assigned_task(&self, node: &str) -> Option<TaskId> {
        fail_closed("assigned_task", self.inner.assigned_task(node))
    }

    pub fn resolve_task_build(&self, task: TaskId) -> Option<BuildId> {
        fail_closed("resolve_task_build", self.inner.resolve_task_build(task))
    }

    pub fn task_destination(&self, task: TaskId) -> Option<PathBuf> {
        fail_closed("task_destination", self.inner.task_destination(task))
    }

    /// `false` means stop: the task was canceled or the registry is down.
    pub fn update_task_status(
        &self,
        task: TaskId,
        status: TaskStatus,
        progress: u8,
        error: &str,
    ) -> bool {
        fail_closed(
            "update_task_status",
            self.inner.update_task_status(task, status, progress, error),
        )
    }

    pub fn active_task_count(&self) -> u64 {
        fail_closed("active_task_count", self.inner.active_task_count())
    }
}
