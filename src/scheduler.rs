//! Concurrency admission, delayed execution and duplicate suppression.
//!
//! All scheduling state is owned by a single actor task; the only way to
//! mutate it is a [`Command`] sent through a [`SchedulerHandle`]. Each
//! submission waits on its own oneshot mailbox for an `Admit` or `Drop`
//! signal, executes on `Admit`, and confirms completion so the freed slot
//! can be handed to the next pending waiter of the same worker type.
//!
//! Policy notes:
//! - Pending waiters of one worker type are admitted strictly in FIFO
//!   order, one per completion.
//! - A due delayed job re-enters admission on timer fire and joins the
//!   tail of the pending queue when no slot is free, so a pending waiter
//!   always wins a slot freed before the timer fires.
//! - Among delayed duplicates with the same deadline, the entry inserted
//!   first survives.

use crate::error::{QueueError, Result};
use crate::executor::{self, Execution};
use crate::job::{DuplicatePolicy, Job};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// What the scheduler tells a waiting submission.
#[derive(Debug)]
enum Admission {
    Admit,
    Drop,
}

enum Command {
    Request {
        job: Job,
        run_at: Option<Instant>,
        reply: oneshot::Sender<Admission>,
    },
    ConfirmDone {
        job: Job,
    },
}

/// Terminal result of one `run` call.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Finished,
    Failed { error: anyhow::Error, trace: String },
    Dropped,
}

struct Waiter {
    job: Job,
    reply: oneshot::Sender<Admission>,
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<Waiter>,
    running: Vec<Job>,
}

impl Lane {
    fn has_copy_of(&self, job: &Job) -> bool {
        self.running.iter().any(|j| j.same_work(job))
            || self.pending.iter().any(|w| w.job.same_work(job))
    }
}

/// Cloneable entry point to the scheduler actor.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

/// Spawn the scheduler actor and return its handle.
pub(crate) fn spawn() -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = Scheduler {
        rx,
        lanes: HashMap::new(),
        delayed: BTreeMap::new(),
        seq: 0,
    };
    tokio::spawn(actor.run());
    SchedulerHandle { tx }
}

impl SchedulerHandle {
    /// Obtain a slot for `job`, execute it, and release the slot.
    ///
    /// `delay` overrides the job's own `delay_until`; retries pass the
    /// backoff here. Returns `Err` only when the actor is gone.
    pub(crate) async fn run(
        &self,
        job: &Job,
        attempt: u32,
        delay: Option<Duration>,
    ) -> Result<RunOutcome> {
        let run_at = match delay {
            Some(d) => Some(Instant::now() + d),
            None => job.delay_until,
        };

        let meta = job.meta();
        if run_at.is_none()
            && meta.max_concurrent.is_unbounded()
            && meta.duplicates == DuplicatePolicy::Accept
        {
            // Nothing for the scheduler to decide; skip the round-trip.
            return Ok(execute(job, attempt).await);
        }

        let (reply, mailbox) = oneshot::channel();
        self.tx
            .send(Command::Request {
                job: job.clone(),
                run_at,
                reply,
            })
            .map_err(|_| QueueError::SchedulerUnavailable)?;

        match mailbox.await {
            Ok(Admission::Admit) => {
                let outcome = execute(job, attempt).await;
                let _ = self.tx.send(Command::ConfirmDone { job: job.clone() });
                Ok(outcome)
            }
            Ok(Admission::Drop) => Ok(RunOutcome::Dropped),
            Err(_) => Err(QueueError::SchedulerUnavailable),
        }
    }
}

async fn execute(job: &Job, attempt: u32) -> RunOutcome {
    match executor::run(job, attempt).await {
        Execution::Success => RunOutcome::Finished,
        Execution::Failure { error, trace } => RunOutcome::Failed { error, trace },
    }
}

struct Scheduler {
    rx: mpsc::UnboundedReceiver<Command>,
    lanes: HashMap<String, Lane>,
    delayed: BTreeMap<(Instant, u64), Waiter>,
    seq: u64,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            let deadline = self.delayed.keys().next().map(|(at, _)| *at);
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    // Every handle is gone; nothing can reach us anymore.
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_due();
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Request { job, run_at, reply } => self.admit(job, run_at, reply),
            Command::ConfirmDone { job } => self.confirm_done(&job),
        }
    }

    /// The admission algorithm: dedup check, delayed insert, then admit
    /// or queue under the concurrency cap.
    fn admit(&mut self, job: Job, run_at: Option<Instant>, reply: oneshot::Sender<Admission>) {
        let dedup = job.meta().duplicates == DuplicatePolicy::Drop;

        if dedup {
            let live = self
                .lanes
                .get(job.worker_name())
                .is_some_and(|lane| lane.has_copy_of(&job));
            if live {
                debug!(job_id = %job.id, worker = job.worker_name(), "dropping duplicate job");
                let _ = reply.send(Admission::Drop);
                return;
            }
        }

        if let Some(at) = run_at {
            if at > Instant::now() {
                self.insert_delayed(at, Waiter { job, reply });
                return;
            }
        }

        let max_concurrent = job.meta().max_concurrent;
        let lane = self.lanes.entry(job.worker_name().to_string()).or_default();
        if max_concurrent.admits(lane.running.len()) {
            if reply.send(Admission::Admit).is_ok() {
                debug!(job_id = %job.id, worker = job.worker_name(), "admitted");
                lane.running.push(job.clone());
            }
        } else {
            debug!(job_id = %job.id, worker = job.worker_name(), "queued, worker at capacity");
            lane.pending.push_back(Waiter {
                job: job.clone(),
                reply,
            });
        }

        // The copy now running or pending makes any delayed copies
        // redundant.
        if dedup {
            Self::sweep_delayed(&mut self.delayed, &job);
        }
    }

    /// Insert a delayed entry, collapsing duplicate delayed submissions of
    /// a drop-dedup worker down to the one with the earliest deadline.
    fn insert_delayed(&mut self, run_at: Instant, waiter: Waiter) {
        if waiter.job.meta().duplicates == DuplicatePolicy::Drop {
            // The collapse below keeps at most one delayed copy per
            // (worker, args), so a single match is the general case.
            let existing = self
                .delayed
                .iter()
                .find(|(_, w)| w.job.same_work(&waiter.job))
                .map(|(key, _)| *key);
            if let Some(key) = existing {
                if key.0 <= run_at {
                    debug!(job_id = %waiter.job.id, "dropping delayed duplicate");
                    let _ = waiter.reply.send(Admission::Drop);
                    return;
                }
                if let Some(older) = self.delayed.remove(&key) {
                    debug!(job_id = %older.job.id, "superseded by an earlier delayed duplicate");
                    let _ = older.reply.send(Admission::Drop);
                }
            }
        }

        self.seq += 1;
        self.delayed.insert((run_at, self.seq), waiter);
    }

    /// Release due delayed entries back into admission. Early or spurious
    /// wakeups find nothing due and simply rearm.
    fn fire_due(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        while self
            .delayed
            .first_key_value()
            .is_some_and(|(key, _)| key.0 <= now)
        {
            if let Some((_, waiter)) = self.delayed.pop_first() {
                due.push(waiter);
            }
        }
        for waiter in due {
            self.admit(waiter.job, None, waiter.reply);
        }
    }

    /// Release the slot held by `job` and hand it to the next pending
    /// waiter, preserving FIFO within the worker type.
    fn confirm_done(&mut self, job: &Job) {
        let lane = self
            .lanes
            .get_mut(job.worker_name())
            .unwrap_or_else(|| panic!("completion for unknown worker {}", job.worker_name()));
        let idx = lane
            .running
            .iter()
            .position(|j| j.id == job.id)
            .unwrap_or_else(|| {
                panic!(
                    "completion for job {} which is not running on {}",
                    job.id,
                    job.worker_name()
                )
            });
        lane.running.remove(idx);

        // Drain one slot per completion. A waiter whose submission task is
        // gone is skipped without consuming the slot.
        while job.meta().max_concurrent.admits(lane.running.len()) {
            let Some(waiter) = lane.pending.pop_front() else {
                break;
            };
            if waiter.reply.send(Admission::Admit).is_ok() {
                debug!(job_id = %waiter.job.id, worker = waiter.job.worker_name(), "admitted from queue");
                lane.running.push(waiter.job.clone());
                if waiter.job.meta().duplicates == DuplicatePolicy::Drop {
                    Self::sweep_delayed(&mut self.delayed, &waiter.job);
                }
                break;
            }
        }
    }

    /// Drop every delayed copy of `job`; a copy just admitted or queued
    /// supersedes them.
    fn sweep_delayed(delayed: &mut BTreeMap<(Instant, u64), Waiter>, job: &Job) {
        let matches: Vec<_> = delayed
            .iter()
            .filter(|(_, w)| w.job.same_work(job))
            .map(|(key, _)| *key)
            .collect();
        for key in matches {
            if let Some(waiter) = delayed.remove(&key) {
                debug!(job_id = %waiter.job.id, "dropping delayed copy of an active job");
                let _ = waiter.reply.send(Admission::Drop);
            }
        }
    }
}
