//! The task poller: picks up tasks the registry assigned to this node and
//! hands them to the matching executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover_config::{log_poller_debug, log_poller_info, log_poller_warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alert::ErrorReporter;
use crate::client::RegistryClient;
use crate::error::NodeError;
use crate::executor::{ExecContext, ExecOutcome, Executor, ExecutorSet, TaskJob};
use crate::registry::{TaskId, TaskStatus};

/// How a dispatched task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Finished,
    /// The registry canceled the task while it ran
    Canceled,
    Failed(String),
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing assigned to this node
    Idle,
    /// Claimed but not runnable; reported Canceled
    Rejected { task: TaskId, reason: String },
    /// Claimed and running
    Dispatched {
        job: TaskJob,
        handle: JoinHandle<TaskResult>,
    },
}

enum Claim {
    Idle,
    Rejected { task: TaskId, reason: String },
    Ready(TaskJob, Arc<dyn Executor>),
}

/// Decrements the active execution count when dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct TaskPoller {
    node: String,
    executors: ExecutorSet,
    ctx: ExecContext,
    active: Arc<AtomicUsize>,
    interval: Duration,
}

impl TaskPoller {
    pub fn new(
        node: impl Into<String>,
        executors: ExecutorSet,
        ctx: ExecContext,
        active: Arc<AtomicUsize>,
        interval: Duration,
    ) -> Self {
        Self {
            node: node.into(),
            executors,
            ctx,
            active,
            interval,
        }
    }

    fn registry(&self) -> &RegistryClient {
        &self.ctx.registry
    }

    fn reject(&self, task: TaskId, reason: String) -> Claim {
        log_poller_warn!(task, reason = %reason, "Canceling task");
        self.registry()
            .update_task_status(task, TaskStatus::Canceled, 0, &reason);
        Claim::Rejected { task, reason }
    }

    /// Claim the next assigned task. The task is marked InProgress before it
    /// is validated, so a rejection sticks as Canceled.
    fn claim(&self) -> Claim {
        let registry = self.registry();
        let Some(task) = registry.assigned_task(&self.node) else {
            return Claim::Idle;
        };
        if !registry.update_task_status(task, TaskStatus::InProgress, 0, "") {
            log_poller_info!(task, "Task canceled before it started");
            return Claim::Idle;
        }

        let build = match registry.resolve_task_build(task) {
            Some(build) if build > 0 => build,
            _ => return self.reject(task, format!("task {} has no valid build", task)),
        };
        let platform = registry.build_platform(build);
        let Some(executor) = self.executors.select(&platform) else {
            return self.reject(task, format!("no executor for platform {:?}", platform));
        };

        let job = TaskJob {
            task,
            build,
            platform,
            destination: registry.task_destination(task),
        };
        Claim::Ready(job, executor)
    }

    fn dispatch(&self, job: TaskJob, executor: Arc<dyn Executor>) -> JoinHandle<TaskResult> {
        let guard = ActiveGuard::new(self.active.clone());
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let run_ctx = ctx.clone();
            let run_job = job.clone();
            let result = match tokio::task::spawn_blocking(move || {
                executor.execute(&run_job, &run_ctx)
            })
            .await
            {
                Ok(Ok(ExecOutcome::Finished)) => TaskResult::Finished,
                Ok(Ok(ExecOutcome::Canceled)) => TaskResult::Canceled,
                Ok(Err(e)) => TaskResult::Failed(format!("{:#}", e)),
                Err(e) => TaskResult::Failed(format!("executor panicked: {}", e)),
            };

            let report = result.clone();
            let task = job.task;
            let reported = tokio::task::spawn_blocking(move || match &report {
                TaskResult::Finished => {
                    ctx.registry
                        .update_task_status(task, TaskStatus::Finished, 100, "");
                }
                TaskResult::Canceled => {}
                TaskResult::Failed(error) => {
                    ctx.registry
                        .update_task_status(task, TaskStatus::Canceled, 0, error);
                }
            })
            .await;
            if let Err(e) = reported {
                log_poller_warn!(task, error = %e, "Could not report task result");
            }

            match &result {
                TaskResult::Failed(error) => {
                    log_poller_warn!(task, error = %error, "Task failed");
                }
                other => log_poller_info!(task, result = ?other, "Task done"),
            }
            drop(guard);
            result
        })
    }

    /// One poll: claim a task if any and start it.
    pub async fn poll_once(&self) -> Result<PollOutcome, NodeError> {
        let this = self.clone();
        let claim = tokio::task::spawn_blocking(move || this.claim()).await?;
        Ok(match claim {
            Claim::Idle => {
                log_poller_debug!("No task assigned");
                PollOutcome::Idle
            }
            Claim::Rejected { task, reason } => PollOutcome::Rejected { task, reason },
            Claim::Ready(job, executor) => {
                log_poller_info!(
                    task = job.task,
                    build = job.build,
                    platform = %job.platform,
                    "Dispatching task"
                );
                let handle = self.dispatch(job.clone(), executor);
                PollOutcome::Dispatched { job, handle }
            }
        })
    }

    pub async fn run(self, reporter: Arc<ErrorReporter>, mut shutdown: watch::Receiver<bool>) {
        log_poller_info!(node = %self.node, "Task poller started");
        loop {
            let pause = match self.poll_once().await {
                Ok(_) => self.interval,
                Err(e) => reporter.report("POLLER", &e),
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log_poller_info!("Task poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheService;
    use crate::queue::CacheQueue;
    use crate::registry::{BuildRecord, MemoryRegistry, TaskRecord};
    use anyhow::bail;
    use drover_cas::ContentStore;

    struct Outcome(Option<ExecOutcome>);

    impl Executor for Outcome {
        fn execute(&self, _job: &TaskJob, _ctx: &ExecContext) -> anyhow::Result<ExecOutcome> {
            match self.0 {
                Some(outcome) => Ok(outcome),
                None => bail!("disk full"),
            }
        }
    }

    fn poller(registry: Arc<MemoryRegistry>, executors: ExecutorSet) -> (TaskPoller, Arc<AtomicUsize>) {
        let (store, _writer) = ContentStore::open("/nonexistent");
        let active = Arc::new(AtomicUsize::new(0));
        let ctx = ExecContext {
            cache: CacheService::new(store, Arc::new(CacheQueue::new())),
            registry: RegistryClient::new(registry),
            file_timeout: Duration::from_secs(1),
            poll: Duration::from_millis(5),
        };
        (
            TaskPoller::new("node-a", executors, ctx, active.clone(), Duration::from_millis(10)),
            active,
        )
    }

    fn registry_with_task(build: i64) -> Arc<MemoryRegistry> {
        Arc::new(
            MemoryRegistry::new()
                .with_build(BuildRecord::new(5, "game", "pc", "/repo/5"))
                .with_task(TaskRecord::assigned(1, build, "node-a")),
        )
    }

    #[tokio::test]
    async fn test_idle_when_nothing_assigned() {
        let (poller, _) = poller(Arc::new(MemoryRegistry::new()), ExecutorSet::new());
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::Idle));
    }

    #[tokio::test]
    async fn test_invalid_build_cancels_task() {
        let registry = registry_with_task(0);
        let executors = ExecutorSet::new().with_wildcard(Arc::new(Outcome(Some(ExecOutcome::Finished))));
        let (poller, _) = poller(registry.clone(), executors);

        let outcome = poller.poll_once().await.unwrap();
        assert!(matches!(outcome, PollOutcome::Rejected { task: 1, .. }));
        let task = registry.task(1).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(!task.error.is_empty());

        // A canceled task is not picked up again.
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::Idle));
    }

    #[tokio::test]
    async fn test_missing_executor_cancels_task() {
        let registry = registry_with_task(5);
        let executors = ExecutorSet::new().register("ps3", Arc::new(Outcome(None)));
        let (poller, _) = poller(registry.clone(), executors);

        let outcome = poller.poll_once().await.unwrap();
        assert!(matches!(outcome, PollOutcome::Rejected { .. }));
        assert!(registry.task(1).unwrap().error.contains("pc"));
    }

    #[tokio::test]
    async fn test_finished_task_reported() {
        let registry = registry_with_task(5);
        let executors = ExecutorSet::new().with_wildcard(Arc::new(Outcome(Some(ExecOutcome::Finished))));
        let (poller, active) = poller(registry.clone(), executors);

        let PollOutcome::Dispatched { job, handle } = poller.poll_once().await.unwrap() else {
            panic!("task was not dispatched");
        };
        assert_eq!(job.build, 5);
        assert_eq!(job.platform, "pc");
        assert_eq!(handle.await.unwrap(), TaskResult::Finished);

        let task = registry.task(1).unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(task.progress, 100);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_executor_error_cancels_with_text() {
        let registry = registry_with_task(5);
        let executors = ExecutorSet::new().with_wildcard(Arc::new(Outcome(None)));
        let (poller, _) = poller(registry.clone(), executors);

        let PollOutcome::Dispatched { handle, .. } = poller.poll_once().await.unwrap() else {
            panic!("task was not dispatched");
        };
        assert_eq!(handle.await.unwrap(), TaskResult::Failed("disk full".into()));

        let task = registry.task(1).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.error, "disk full");
    }

    #[tokio::test]
    async fn test_registry_outage_is_idle() {
        let registry = registry_with_task(5);
        registry.set_offline(true);
        let (poller, _) = poller(registry, ExecutorSet::new());
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::Idle));
    }
}
