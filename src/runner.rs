//! Per-submission driver.
//!
//! Each accepted submission gets its own task that walks the job through
//! the scheduler, applies the resolved retry config on failure, and
//! publishes exactly one terminal event. Retry state never leaves the
//! task.

use crate::events::{EventBus, EventKind, JobEvent};
use crate::job::Job;
use crate::retry::RetryConfig;
use crate::scheduler::{RunOutcome, SchedulerHandle};
use std::time::Duration;
use tracing::{debug, error};

pub(crate) fn spawn_submission(
    scheduler: SchedulerHandle,
    bus: EventBus,
    job: Job,
    cfg: RetryConfig,
) {
    tokio::spawn(async move {
        // The first run consults the job's own delay; retries override it
        // with the computed backoff.
        let mut delay: Option<Duration> = None;
        let mut attempt: u32 = 0;

        loop {
            let outcome = match scheduler.run(&job, attempt + 1, delay).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(
                        job_id = %job.id,
                        worker = job.worker_name(),
                        error = %err,
                        "abandoning submission"
                    );
                    return;
                }
            };

            match outcome {
                RunOutcome::Finished => {
                    debug!(job_id = %job.id, worker = job.worker_name(), "job finished");
                    bus.publish(JobEvent {
                        kind: EventKind::Finished,
                        job,
                    });
                    return;
                }
                RunOutcome::Dropped => {
                    debug!(job_id = %job.id, worker = job.worker_name(), "job dropped");
                    bus.publish(JobEvent {
                        kind: EventKind::Dropped,
                        job,
                    });
                    return;
                }
                RunOutcome::Failed { error: cause, trace } => {
                    attempt += 1;
                    if cfg.should_retry(attempt) {
                        let backoff = cfg.delay_for(attempt);
                        debug!(
                            job_id = %job.id,
                            worker = job.worker_name(),
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %cause,
                            "job failed, retrying"
                        );
                        delay = Some(backoff);
                    } else {
                        error!(
                            job_id = %job.id,
                            worker = job.worker_name(),
                            args = %job.args,
                            error = %cause,
                            trace = %trace,
                            "job failed, retries exhausted"
                        );
                        bus.publish(JobEvent {
                            kind: EventKind::Failed,
                            job,
                        });
                        return;
                    }
                }
            }
        }
    });
}
