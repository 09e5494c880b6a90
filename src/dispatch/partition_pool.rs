use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::hash::Hasher;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::bail;
use futures::future::BoxFuture;
use futures::FutureExt;
use rustc_hash::FxHasher;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

use crate::error::TransportError;

pub const DEFAULT_NUM_WORKERS: usize = 64;
pub const DEFAULT_INBOX_SIZE: usize = 1024;

type Job = BoxFuture<'static, ()>;

/// A fixed set of workers, each processing its own bounded inbox strictly in order. Jobs are
///  assigned to a worker by hashing an entity id, so all jobs for the same entity run one after
///  the other, while jobs for different entities can run in parallel.
///
/// The number of workers must be a power of two so that a partition can be picked by masking
///  the hash.
pub struct WorkPartitionPool {
    inboxes: Vec<mpsc::Sender<Job>>,
    mask: u32,
    shutdown: CancellationToken,
    workers: TaskTracker,
    num_rejected: AtomicU64,
}

impl Debug for WorkPartitionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkPartitionPool{{workers:{}}}", self.inboxes.len())
    }
}

impl WorkPartitionPool {
    /// Spawns the workers, so this must be called from inside a tokio runtime
    pub fn new(num_workers: usize, inbox_size: usize) -> anyhow::Result<WorkPartitionPool> {
        if !num_workers.is_power_of_two() {
            bail!("number of workers must be a power of two, was {}", num_workers);
        }
        if num_workers > u32::MAX as usize {
            bail!("too many workers: {}", num_workers);
        }
        if inbox_size == 0 {
            bail!("inbox size must be positive");
        }

        let shutdown = CancellationToken::new();
        let workers = TaskTracker::new();

        let mut inboxes = Vec::with_capacity(num_workers);
        for partition in 0..num_workers {
            let (send, recv) = mpsc::channel(inbox_size);
            inboxes.push(send);
            workers.spawn(Self::do_work(partition, recv, shutdown.clone()));
        }
        workers.close();

        debug!("started partition pool with {} workers", num_workers);
        Ok(WorkPartitionPool {
            inboxes,
            mask: (num_workers - 1) as u32,
            shutdown,
            workers,
            num_rejected: AtomicU64::new(0),
        })
    }

    pub fn with_defaults() -> anyhow::Result<WorkPartitionPool> {
        Self::new(DEFAULT_NUM_WORKERS, DEFAULT_INBOX_SIZE)
    }

    async fn do_work(partition: usize, mut inbox: mpsc::Receiver<Job>, shutdown: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = inbox.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                error!("job panicked in partition worker {}", partition);
            }
        }
        trace!("partition worker {} stopped", partition);
    }

    pub fn num_workers(&self) -> usize {
        self.inboxes.len()
    }

    /// The partition that jobs for a given entity are assigned to. This is stable for the
    ///  lifetime of the pool.
    pub fn partition_for(&self, entity_id: u64) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_u64(entity_id);
        (hasher.finish() as u32 & self.mask) as usize
    }

    /// Enqueues a job without waiting. If the responsible worker's inbox is full, the job is
    ///  rejected and not retried.
    pub fn submit(&self, entity_id: u64, job: impl Future<Output = ()> + Send + 'static) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::PoolStopped);
        }

        let partition = self.partition_for(entity_id);
        match self.inboxes[partition].try_send(job.boxed()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.num_rejected.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::PoolInboxFull { partition })
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::PoolStopped),
        }
    }

    /// number of jobs rejected so far because an inbox was full
    pub fn num_rejected(&self) -> u64 {
        self.num_rejected.load(Ordering::Relaxed)
    }

    /// Stops all workers. Jobs that are still queued are discarded.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("shutting down partition pool");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// waits until all workers have terminated after [WorkPartitionPool::shutdown]
    pub async fn join(&self) {
        self.workers.wait().await;
    }
}

impl Drop for WorkPartitionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
