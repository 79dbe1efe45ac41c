//! The cache worker loop: the only writer of the content store.
//!
//! Takes one pending operation at a time and carries it out on the blocking
//! pool. A failed operation goes back into the queue and is not retried
//! before its backoff has passed; other pending work carries on meanwhile.
//! There is no retry limit.

use std::sync::Arc;
use std::time::Duration;

use drover_cas::{AddOutcome, CasError, ContentStore, Fetch, RemoveOutcome, StoreWriter};
use drover_config::{log_worker_debug, log_worker_info, log_worker_warn};
use tokio::sync::watch;

use crate::alert::ErrorReporter;
use crate::error::NodeError;
use crate::queue::{CacheOperation, CacheQueue, OpKind};

/// Snapshot published after every processed operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatus {
    pub entries: usize,
    pub total_bytes: u64,
    pub pending: usize,
    pub pending_forced: usize,
    pub processed: u64,
    pub failed: u64,
}

pub struct CacheWorker {
    writer: StoreWriter,
    store: ContentStore,
    queue: Arc<CacheQueue>,
    fetch: Arc<dyn Fetch>,
    idle_sleep: Duration,
    /// Delay before a failed operation is attempted again
    retry_backoff: Duration,
    processed: u64,
    failed: u64,
    status: watch::Sender<CacheStatus>,
}

impl CacheWorker {
    pub fn new(
        writer: StoreWriter,
        queue: Arc<CacheQueue>,
        fetch: Arc<dyn Fetch>,
        idle_sleep: Duration,
        retry_backoff: Duration,
    ) -> Self {
        let store = writer.reader();
        let (status, _) = watch::channel(CacheStatus::default());
        let worker = Self {
            writer,
            store,
            queue,
            fetch,
            idle_sleep,
            retry_backoff,
            processed: 0,
            failed: 0,
            status,
        };
        worker.publish();
        worker
    }

    pub fn subscribe(&self) -> watch::Receiver<CacheStatus> {
        self.status.subscribe()
    }

    pub fn writer(&self) -> &StoreWriter {
        &self.writer
    }

    fn publish(&self) {
        let snapshot = CacheStatus {
            entries: self.store.len(),
            total_bytes: self.store.total_size(),
            pending: self.queue.len(),
            pending_forced: self.queue.forced_len(),
            processed: self.processed,
            failed: self.failed,
        };
        self.status.send_replace(snapshot);
    }

    /// Carry out a single operation against the store.
    pub fn process(&self, op: &CacheOperation) -> drover_cas::Result<()> {
        match op.kind {
            OpKind::Add => {
                let outcome = self
                    .writer
                    .add(&op.hash, &op.source, op.force, self.fetch.as_ref())?;
                match outcome {
                    AddOutcome::AlreadyCached => {
                        log_worker_debug!(hash = %op.hash, "Already cached");
                    }
                    AddOutcome::Copied { size, replaced } => {
                        self.check_size(op, size);
                        log_worker_info!(
                            hash = %op.hash,
                            size,
                            replaced,
                            source = %op.source.display(),
                            "Cached file"
                        );
                    }
                    AddOutcome::Adopted { size } => {
                        self.check_size(op, size);
                        log_worker_info!(hash = %op.hash, size, "Adopted file already on disk");
                    }
                }
            }
            OpKind::Remove => match self.writer.remove(&op.hash)? {
                RemoveOutcome::NotCached => {
                    log_worker_debug!(hash = %op.hash, "Remove of uncached file");
                }
                RemoveOutcome::Missing => {
                    log_worker_warn!(hash = %op.hash, "Indexed file was missing on disk");
                }
                RemoveOutcome::Removed { size } => {
                    log_worker_info!(hash = %op.hash, size, "Removed file");
                }
            },
        }
        Ok(())
    }

    fn check_size(&self, op: &CacheOperation, observed: u64) {
        if op.size != 0 && op.size != observed {
            log_worker_warn!(
                hash = %op.hash,
                expected = op.size,
                observed,
                "Cached size differs from manifest"
            );
        }
    }

    /// Process one ready operation. `None` when nothing was ready,
    /// otherwise the operation's result.
    pub fn try_step(&mut self) -> Option<Result<(), CasError>> {
        let op = self.queue.take()?;
        let result = self.process(&op);
        match &result {
            Ok(()) => self.processed += 1,
            Err(e) => {
                self.failed += 1;
                log_worker_warn!(
                    hash = %op.hash,
                    kind = ?op.kind,
                    error = %e,
                    retry_secs = self.retry_backoff.as_secs(),
                    "Cache operation failed, re-queueing"
                );
                let hash = op.hash;
                if !self.queue.requeue(op, self.retry_backoff) {
                    log_worker_debug!(%hash, "Superseded while in flight, failed operation dropped");
                }
            }
        }
        self.publish();
        Some(result)
    }

    /// Like [`try_step`](Self::try_step), reduced to whether it succeeded.
    pub fn step(&mut self) -> Option<bool> {
        self.try_step().map(|result| result.is_ok())
    }

    /// Drain the queue on the current thread. Operations that keep failing
    /// are attempted at most `max_attempts` times in total.
    pub fn run_until_empty(&mut self, max_attempts: usize) -> usize {
        let mut attempts = 0;
        while attempts < max_attempts && self.step().is_some() {
            attempts += 1;
        }
        attempts
    }

    /// Run until `shutdown` flips to `true` or its sender goes away.
    ///
    /// Failures also go through `reporter`, which logs and alerts with its
    /// own throttle.
    pub async fn run(
        self,
        reporter: Arc<ErrorReporter>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), NodeError> {
        log_worker_info!(
            retry_backoff_secs = self.retry_backoff.as_secs(),
            "Cache worker started"
        );
        let mut worker = self;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match worker.queue.next_ready_in() {
                Some(wait) if wait.is_zero() => None,
                Some(wait) => Some(wait.min(worker.idle_sleep)),
                None => Some(worker.idle_sleep),
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = worker.try_step();
                (worker, result)
            })
            .await?;
            worker = returned;
            if let Some(Err(e)) = result {
                reporter.report("WORKER", &e);
            }
        }
        log_worker_info!("Cache worker stopped");
        Ok(())
    }
}
