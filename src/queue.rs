//! The public queue facade.
//!
//! A [`JobQueue`] owns the worker registry, the scheduler actor and the
//! event bus. `enqueue` validates everything it can, mints a job id,
//! hands the job to its own driver task and returns without blocking on
//! execution.

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::events::{EventBus, EventStream, SubscriberId};
use crate::job::{Job, Worker, WorkerHandle};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::{runner, scheduler};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Options accepted by [`JobQueue::enqueue_opts`]: a per-job retry
/// override and an initial delay in milliseconds. Nothing else.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EnqueueOptions {
    pub retry: Option<RetryPolicy>,
    pub delay_for: Option<u64>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn delay_for(mut self, delay_ms: u64) -> Self {
        self.delay_for = Some(delay_ms);
        self
    }
}

/// In-process background job queue.
///
/// Cloning is cheap; every clone talks to the same scheduler, registry
/// and event bus. Nothing survives the process: when the queue is gone,
/// pending, delayed and running jobs are gone with it.
#[derive(Clone)]
pub struct JobQueue {
    workers: Arc<RwLock<HashMap<&'static str, Arc<WorkerHandle>>>>,
    scheduler: scheduler::SchedulerHandle,
    bus: EventBus,
    global_retry: Option<RetryPolicy>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let queue = Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            scheduler: scheduler::spawn(),
            bus: EventBus::new(),
            global_retry: config.retry,
        };
        info!("job queue started");
        queue
    }

    /// Register a worker type under `W::NAME`. Re-registration replaces
    /// the previous instance.
    pub async fn register_worker<W: Worker>(&self, worker: W) -> Result<()> {
        let handle = WorkerHandle::erase(worker)?;
        self.workers.write().await.insert(W::NAME, Arc::new(handle));
        info!(worker = W::NAME, "registered worker");
        Ok(())
    }

    /// Enqueue a job with default options.
    pub async fn enqueue<W: Worker>(&self, args: W::Args) -> Result<String> {
        self.enqueue_opts::<W>(args, EnqueueOptions::default()).await
    }

    /// Enqueue a job. Returns the job id as soon as the submission is
    /// handed to its driver task; completion is reported via the bus.
    pub async fn enqueue_opts<W: Worker>(
        &self,
        args: W::Args,
        opts: EnqueueOptions,
    ) -> Result<String> {
        let worker = self
            .workers
            .read()
            .await
            .get(W::NAME)
            .cloned()
            .ok_or_else(|| QueueError::UnknownWorker(W::NAME.to_string()))?;

        let args = serde_json::to_value(args)?;

        // Resolve the three retry layers now so a bad override fails the
        // enqueue call, and the config stays fixed for the submission.
        let cfg = RetryConfig::resolve(
            self.global_retry.as_ref(),
            worker.meta.retry.as_ref(),
            opts.retry.as_ref(),
        );

        let job = Job {
            id: Uuid::new_v4().to_string(),
            worker,
            args,
            retry: opts.retry,
            delay_until: opts
                .delay_for
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
            created_at: chrono::Utc::now(),
        };
        let id = job.id.clone();

        runner::spawn_submission(self.scheduler.clone(), self.bus.clone(), job, cfg);
        Ok(id)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Remove a subscriber; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.bus.unsubscribe(id);
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
