//! # Conveyor
//!
//! A non-persistent, in-process background job queue.
//!
//! Workers declare a concurrency cap, a retry override and a duplicate
//! policy; submissions flow through a single scheduler actor that admits
//! them up to the cap, holds delayed jobs until their monotonic deadline,
//! and drops redundant copies for workers that opt in. Failures are
//! retried per a three-layer merged policy with exponential backoff, and
//! every submission ends in exactly one lifecycle event: `Finished`,
//! `Failed` or `Dropped`.
//!
//! Nothing is persisted. When the process exits, pending, delayed and
//! running jobs are lost.
//!
//! ```rust,ignore
//! use conveyor::{JobQueue, Worker, JobContext, Concurrency};
//!
//! struct SendEmail;
//!
//! #[async_trait::async_trait]
//! impl Worker for SendEmail {
//!     const NAME: &'static str = "send_email";
//!     type Args = String;
//!
//!     fn max_concurrent() -> Concurrency {
//!         Concurrency::Limit(4)
//!     }
//!
//!     async fn invoke(&self, _ctx: JobContext, to: String) -> anyhow::Result<()> {
//!         deliver(&to).await
//!     }
//! }
//!
//! let queue = JobQueue::new();
//! queue.register_worker(SendEmail).await?;
//! let id = queue.enqueue::<SendEmail>("user@example.com".into()).await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod retry;

mod executor;
mod runner;
mod scheduler;

pub use config::QueueConfig;
pub use error::{CrashError, QueueError, Result};
pub use events::{EventBus, EventKind, EventStream, JobEvent, SubscriberId};
pub use job::{Concurrency, DuplicatePolicy, Job, JobContext, Worker};
pub use queue::{EnqueueOptions, JobQueue};
pub use retry::{Limit, RetryConfig, RetryPolicy};
