//! Jobs and worker types.
//!
//! A [`Worker`] is the static descriptor of one kind of background work:
//! its name, typed arguments, concurrency cap, retry override, duplicate
//! policy and the `invoke` body. Registration erases a worker instance
//! into a [`WorkerHandle`] so jobs can carry it without generics.

use crate::error::{QueueError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::time::Instant;

/// How many invocations of one worker type may run at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    #[default]
    Unbounded,
    /// A positive cap. Zero is rejected at registration.
    Limit(usize),
}

impl Concurrency {
    pub(crate) fn admits(&self, running: usize) -> bool {
        match self {
            Concurrency::Unbounded => true,
            Concurrency::Limit(max) => running < *max,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Concurrency::Unbounded)
    }
}

/// What to do with a job whose (worker, args) pair is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Accept the copy; both run.
    #[default]
    Accept,
    /// Drop the redundant copy and surface a `Dropped` event.
    Drop,
}

/// Context passed to every worker invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    /// 1-based run number for this submission; 1 is the initial attempt.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// A worker type: the user-provided execution entry point plus its
/// scheduling declarations.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The worker name. Jobs are routed and dedup-compared by it.
    const NAME: &'static str;

    /// The arguments the worker accepts.
    type Args: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// Parallelism cap for this worker type.
    fn max_concurrent() -> Concurrency {
        Concurrency::Unbounded
    }

    /// Per-worker retry override, merged over the global setting.
    fn retry() -> Option<RetryPolicy> {
        None
    }

    /// Duplicate handling for jobs with equal (worker, args).
    fn duplicates() -> DuplicatePolicy {
        DuplicatePolicy::Accept
    }

    /// Execute one job.
    async fn invoke(&self, ctx: JobContext, args: Self::Args) -> anyhow::Result<()>;
}

/// Object-safe form of [`Worker`] with the args erased to JSON.
#[async_trait]
pub(crate) trait ErasedWorker: Send + Sync {
    async fn handle(&self, ctx: JobContext, args: serde_json::Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<W: Worker> ErasedWorker for W {
    async fn handle(&self, ctx: JobContext, args: serde_json::Value) -> anyhow::Result<()> {
        let args: W::Args = serde_json::from_value(args)?;
        self.invoke(ctx, args).await
    }
}

/// The scheduling-relevant declarations of a worker type.
#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub name: &'static str,
    pub max_concurrent: Concurrency,
    pub retry: Option<RetryPolicy>,
    pub duplicates: DuplicatePolicy,
}

/// A registered worker: metadata plus the type-erased handler.
pub struct WorkerHandle {
    pub(crate) meta: WorkerMeta,
    pub(crate) handler: Box<dyn ErasedWorker>,
}

impl WorkerHandle {
    pub(crate) fn erase<W: Worker>(worker: W) -> Result<Self> {
        if let Concurrency::Limit(0) = W::max_concurrent() {
            return Err(QueueError::Config(format!(
                "worker {} declares max_concurrent = 0; the cap must be positive",
                W::NAME
            )));
        }
        Ok(Self {
            meta: WorkerMeta {
                name: W::NAME,
                max_concurrent: W::max_concurrent(),
                retry: W::retry(),
                duplicates: W::duplicates(),
            },
            handler: Box::new(worker),
        })
    }
}

impl Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// One submission of work. Immutable once built; cloned freely between
/// the coordinator, the scheduler and event subscribers.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub(crate) worker: Arc<WorkerHandle>,
    pub args: serde_json::Value,
    /// Per-job retry override captured at enqueue time.
    pub retry: Option<RetryPolicy>,
    /// Absolute monotonic deadline before which the job must not run.
    pub(crate) delay_until: Option<Instant>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn worker_name(&self) -> &str {
        self.worker.meta.name
    }

    pub(crate) fn meta(&self) -> &WorkerMeta {
        &self.worker.meta
    }

    /// Equal-for-dedup: same worker type and structurally equal args.
    /// Id and timing are ignored.
    pub(crate) fn same_work(&self, other: &Job) -> bool {
        self.worker.meta.name == other.worker.meta.name && self.args == other.args
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("worker", &self.worker.meta.name)
            .field("args", &self.args)
            .field("retry", &self.retry)
            .field("created_at", &self.created_at)
            .finish()
    }
}
