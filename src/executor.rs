//! Isolated execution of a single worker invocation.
//!
//! The worker body runs in its own spawned task so that a panic or an
//! abort cannot destabilize the scheduler. The executor never retries and
//! never talks to the scheduler; it only reports what happened.

use crate::error::CrashError;
use crate::job::{Job, JobContext};

/// Outcome of one invocation.
#[derive(Debug)]
pub(crate) enum Execution {
    Success,
    Failure { error: anyhow::Error, trace: String },
}

/// Run `job.worker.invoke(job.args)` once, in a child task.
///
/// `attempt` is the 1-based run number for this submission.
pub(crate) async fn run(job: &Job, attempt: u32) -> Execution {
    let worker = job.worker.clone();
    let ctx = JobContext {
        job_id: job.id.clone(),
        attempt,
        created_at: job.created_at,
    };
    let args = job.args.clone();

    let child = tokio::spawn(async move { worker.handler.handle(ctx, args).await });

    match child.await {
        Ok(Ok(())) => Execution::Success,
        Ok(Err(error)) => {
            let trace = error.backtrace().to_string();
            Execution::Failure { error, trace }
        }
        Err(join_err) if join_err.is_panic() => {
            // A panic inside `invoke` is the raised-error case. The panic
            // machinery already unwound the stack, so no trace survives.
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            Execution::Failure {
                error: anyhow::anyhow!(message),
                trace: String::new(),
            }
        }
        Err(join_err) => Execution::Failure {
            error: anyhow::Error::new(CrashError(join_err.to_string())),
            trace: String::new(),
        },
    }
}
