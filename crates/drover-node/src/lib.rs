//! # drover-node
//!
//! A distribution node: pulls platform builds from the central repository
//! into a local, disk-bounded content cache and delivers them for the tasks
//! the registry assigns to it.
//!
//! ## Architecture
//!
//! ```text
//!  TaskPoller ──┐
//!  Executors ───┼──▶ CacheQueue ──▶ CacheWorker ──▶ ContentStore
//!  Maintenance ─┘                     (single writer)
//! ```
//!
//! Three long-lived tokio tasks run side by side: the cache worker, the
//! maintenance loop and the task poller. They share the store's index and
//! the pending queue, nothing else. The registry is passed in explicitly.

pub mod alert;
pub mod cache;
pub mod client;
pub mod error;
pub mod executor;
pub mod maintenance;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod worker;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use drover_cas::{ContentStore, Fetch, IndexReport};
use drover_config::{log_node_error, log_node_info, Config};
use tokio::sync::watch;

pub use alert::{AlertSink, ErrorReporter, LogAlertSink};
pub use cache::CacheService;
pub use client::RegistryClient;
pub use error::{NodeError, Result};
pub use executor::{DirectoryExecutor, ExecContext, ExecOutcome, Executor, ExecutorSet, TaskJob};
pub use maintenance::{Maintenance, MaintenanceReport, MaintenanceSettings};
pub use poller::{PollOutcome, TaskPoller, TaskResult};
pub use queue::{CacheOperation, CacheQueue, OpKind, Priority};
pub use worker::{CacheStatus, CacheWorker};

/// Runtime settings for a node, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub cache_root: PathBuf,
    pub size_limit: u64,
    pub node_name: String,
    pub idle_sleep: Duration,
    pub maintenance_interval: Duration,
    pub orphan_sample_size: usize,
    pub precache_builds: usize,
    pub poll_interval: Duration,
    pub file_timeout: Duration,
    pub error_backoff: Duration,
}

impl NodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_root: config.cache.root.clone(),
            size_limit: config.cache.size_limit,
            node_name: config.node_name(),
            idle_sleep: config.worker.idle_sleep(),
            maintenance_interval: config.maintenance.interval(),
            orphan_sample_size: config.maintenance.orphan_sample_size,
            precache_builds: config.maintenance.precache_builds,
            poll_interval: config.poller.interval(),
            file_timeout: config.poller.file_timeout(),
            error_backoff: config.alerts.error_backoff(),
        }
    }
}

pub struct Node {
    settings: NodeSettings,
    cache: CacheService,
    registry: RegistryClient,
    worker: CacheWorker,
    maintenance: Maintenance,
    poller: TaskPoller,
    reporter: Arc<ErrorReporter>,
    status: watch::Receiver<CacheStatus>,
}

impl Node {
    pub fn new(
        settings: NodeSettings,
        registry: Arc<dyn registry::Registry>,
        executors: ExecutorSet,
        alerts: Box<dyn AlertSink>,
        fetch: Arc<dyn Fetch>,
    ) -> Self {
        let (store, writer) = ContentStore::open(&settings.cache_root);
        let queue = Arc::new(CacheQueue::new());
        let cache = CacheService::new(store, queue.clone());
        let registry = RegistryClient::new(registry);
        let active = Arc::new(AtomicUsize::new(0));

        let worker = CacheWorker::new(
            writer,
            queue,
            fetch,
            settings.idle_sleep,
            settings.error_backoff,
        );
        let status = worker.subscribe();

        let maintenance = Maintenance::new(
            cache.clone(),
            registry.clone(),
            active.clone(),
            MaintenanceSettings {
                interval: settings.maintenance_interval,
                orphan_sample_size: settings.orphan_sample_size,
                precache_builds: settings.precache_builds,
                size_limit: settings.size_limit,
            },
        );

        let ctx = ExecContext {
            cache: cache.clone(),
            registry: registry.clone(),
            file_timeout: settings.file_timeout,
            poll: settings.idle_sleep,
        };
        let poller = TaskPoller::new(
            settings.node_name.clone(),
            executors,
            ctx,
            active,
            settings.poll_interval,
        );

        Self {
            reporter: Arc::new(ErrorReporter::new(alerts, settings.error_backoff)),
            settings,
            cache,
            registry,
            worker,
            maintenance,
            poller,
            status,
        }
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Create the shard directories and rebuild the index from disk.
    pub fn initialize(&self) -> Result<IndexReport> {
        Ok(self.worker.writer().initialize()?)
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    /// Receives a [`CacheStatus`] after every processed operation.
    pub fn status(&self) -> watch::Receiver<CacheStatus> {
        self.status.clone()
    }

    /// Initialize, start the three loops and run until `shutdown` resolves.
    ///
    /// Work in flight at shutdown is abandoned, not drained.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let report = self.initialize()?;
        log_node_info!(
            node = %self.settings.node_name,
            root = %self.settings.cache_root.display(),
            entries = report.entries,
            bytes = report.total_bytes,
            limit = self.settings.size_limit,
            "Node starting"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut worker = tokio::spawn(self.worker.run(self.reporter.clone(), stop_rx.clone()));
        let maintenance = tokio::spawn(
            self.maintenance
                .run(self.reporter.clone(), stop_rx.clone()),
        );
        let poller = tokio::spawn(self.poller.run(self.reporter.clone(), stop_rx));

        let result = tokio::select! {
            _ = shutdown => {
                log_node_info!("Shutdown requested");
                Ok(())
            }
            joined = &mut worker => {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => Err(NodeError::from(e)),
                };
                if let Err(e) = &result {
                    log_node_error!(error = %e, "Cache worker stopped unexpectedly");
                }
                result
            }
        };

        stop_tx.send_replace(true);
        worker.abort();
        maintenance.abort();
        poller.abort();
        log_node_info!("Node stopped");
        result
    }
}
