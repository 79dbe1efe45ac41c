//! Task executors: the platform specific step that delivers a cached build.
//!
//! An executor runs on a blocking thread and may take as long as the copy
//! needs. It reports progress through the registry and must stop when an
//! update comes back `false`.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use drover_cas::ContentHash;
use drover_config::{log_poller_debug, log_poller_info};

use crate::cache::CacheService;
use crate::client::RegistryClient;
use crate::queue::Priority;
use crate::registry::{BuildId, TaskId, TaskStatus};

/// One dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskJob {
    pub task: TaskId,
    pub build: BuildId,
    pub platform: String,
    pub destination: Option<PathBuf>,
}

/// What executors get to work with.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub cache: CacheService,
    pub registry: RegistryClient,
    /// Longest wait for a single file to reach the cache
    pub file_timeout: Duration,
    /// Pause between availability checks
    pub poll: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Finished,
    /// Stopped because the registry canceled the task
    Canceled,
}

pub trait Executor: Send + Sync {
    fn execute(&self, job: &TaskJob, ctx: &ExecContext) -> anyhow::Result<ExecOutcome>;
}

/// Executors keyed by platform tag, with an optional catch-all.
#[derive(Default, Clone)]
pub struct ExecutorSet {
    by_platform: HashMap<String, Arc<dyn Executor>>,
    wildcard: Option<Arc<dyn Executor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, platform: &str, executor: Arc<dyn Executor>) -> Self {
        self.by_platform
            .insert(platform.to_ascii_lowercase(), executor);
        self
    }

    pub fn with_wildcard(mut self, executor: Arc<dyn Executor>) -> Self {
        self.wildcard = Some(executor);
        self
    }

    pub fn select(&self, platform: &str) -> Option<Arc<dyn Executor>> {
        self.by_platform
            .get(&platform.to_ascii_lowercase())
            .or(self.wildcard.as_ref())
            .cloned()
    }
}

/// Copies every file of the build out of the cache into the task's
/// destination directory, keeping the manifest's relative layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryExecutor;

fn check_relative(path: &Path) -> anyhow::Result<()> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        bail!("manifest path {} is not a plain relative path", path.display());
    }
    Ok(())
}

fn wait_until_cached(ctx: &ExecContext, hash: &ContentHash, source: &Path) -> anyhow::Result<()> {
    let start = Instant::now();
    while !ctx.cache.request_availability(hash, source) {
        if start.elapsed() >= ctx.file_timeout {
            bail!(
                "{} ({}) not cached after {}s",
                source.display(),
                hash,
                ctx.file_timeout.as_secs()
            );
        }
        std::thread::sleep(ctx.poll);
    }
    Ok(())
}

impl Executor for DirectoryExecutor {
    fn execute(&self, job: &TaskJob, ctx: &ExecContext) -> anyhow::Result<ExecOutcome> {
        let destination = job
            .destination
            .as_ref()
            .with_context(|| format!("task {} has no destination", job.task))?;
        let manifest = ctx.registry.build_manifest(job.build);
        if manifest.is_empty() {
            bail!("build {} has no files", job.build);
        }
        for entry in &manifest {
            check_relative(&entry.path)?;
        }

        let root = ctx.registry.repository_root(job.build);
        ctx.cache.request_build(&manifest, &root, Priority::Forced);
        log_poller_info!(
            task = job.task,
            build = job.build,
            files = manifest.len(),
            destination = %destination.display(),
            "Delivering build"
        );

        let total = manifest.len();
        let mut reported = 0u8;
        for (done, entry) in manifest.iter().enumerate() {
            wait_until_cached(ctx, &entry.hash, &root.join(&entry.path))?;

            let target = destination.join(&entry.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::copy(ctx.cache.store().path(&entry.hash), &target)
                .with_context(|| format!("failed to copy {} to {}", entry.hash, target.display()))?;

            let percent = ((done + 1) * 100 / total) as u8;
            if percent != reported {
                reported = percent;
                if !ctx
                    .registry
                    .update_task_status(job.task, TaskStatus::InProgress, percent, "")
                {
                    log_poller_info!(task = job.task, "Task canceled by registry");
                    return Ok(ExecOutcome::Canceled);
                }
                log_poller_debug!(task = job.task, percent, "Progress");
            }
        }
        Ok(ExecOutcome::Finished)
    }
}
