use async_trait::async_trait;
use conveyor::{
    Concurrency, EnqueueOptions, EventKind, JobContext, JobQueue, QueueConfig, RetryPolicy, Worker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

/// Let every spawned task run to its next suspension point. With the
/// paused clock this advances time by a single millisecond at most.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Clone)]
struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl Worker for Recorder {
    const NAME: &'static str = "recorder";
    type Args = u32;

    async fn invoke(&self, _ctx: JobContext, n: u32) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(n);
        Ok(())
    }
}

#[tokio::test]
async fn unbounded_worker_finishes_every_job() {
    let queue = JobQueue::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_worker(Recorder { seen: seen.clone() })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    for n in [1, 2, 3] {
        queue.enqueue::<Recorder>(n).await.unwrap();
    }

    for _ in 0..3 {
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Finished);
    }
    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn enqueue_for_an_unregistered_worker_fails() {
    let queue = JobQueue::new();
    let err = queue.enqueue::<Recorder>(1).await.unwrap_err();
    assert!(matches!(err, conveyor::QueueError::UnknownWorker(_)));
}

/// Signals when an invocation starts, then blocks until its gate opens.
#[derive(Clone)]
struct Gated {
    starts: mpsc::UnboundedSender<u32>,
    gates: Arc<Vec<Semaphore>>,
}

#[async_trait]
impl Worker for Gated {
    const NAME: &'static str = "gated";
    type Args = u32;

    fn max_concurrent() -> Concurrency {
        Concurrency::Limit(2)
    }

    async fn invoke(&self, _ctx: JobContext, idx: u32) -> anyhow::Result<()> {
        let _ = self.starts.send(idx);
        let _permit = self.gates[idx as usize].acquire().await?;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_holds_and_queue_drains_fifo() {
    let queue = JobQueue::new();
    let (tx, mut starts) = mpsc::unbounded_channel();
    let gates: Arc<Vec<Semaphore>> = Arc::new((0..4).map(|_| Semaphore::new(0)).collect());
    queue
        .register_worker(Gated {
            starts: tx,
            gates: gates.clone(),
        })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    for idx in 0..4u32 {
        queue.enqueue::<Gated>(idx).await.unwrap();
        settle().await;
    }

    // The first two occupy both slots; the rest must wait.
    let mut first = vec![starts.recv().await.unwrap(), starts.recv().await.unwrap()];
    first.sort_unstable();
    assert_eq!(first, vec![0, 1]);
    settle().await;
    assert!(starts.try_recv().is_err(), "no more than two may run");

    // Freeing a slot admits the earliest queued job, in request order.
    gates[0].add_permits(1);
    assert_eq!(starts.recv().await, Some(2));
    settle().await;
    assert!(starts.try_recv().is_err());

    gates[1].add_permits(1);
    assert_eq!(starts.recv().await, Some(3));

    gates[2].add_permits(1);
    gates[3].add_permits(1);
    for _ in 0..4 {
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Finished);
    }
}

#[derive(Clone)]
struct Saturator {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for Saturator {
    const NAME: &'static str = "saturator";
    type Args = u32;

    fn max_concurrent() -> Concurrency {
        Concurrency::Limit(2)
    }

    async fn invoke(&self, _ctx: JobContext, _n: u32) -> anyhow::Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn running_count_never_exceeds_the_cap() {
    let queue = JobQueue::new();
    let peak = Arc::new(AtomicUsize::new(0));
    queue
        .register_worker(Saturator {
            active: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    for n in 0..10u32 {
        queue.enqueue::<Saturator>(n).await.unwrap();
    }
    for _ in 0..10 {
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Finished);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[derive(Clone)]
struct AlwaysFails {
    runs: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Worker for AlwaysFails {
    const NAME: &'static str = "always_fails";
    type Args = ();

    async fn invoke(&self, _ctx: JobContext, _args: ()) -> anyhow::Result<()> {
        self.runs.lock().unwrap().push(Instant::now());
        anyhow::bail!("this worker never succeeds")
    }
}

fn assert_close(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    assert!(
        actual >= expected && actual <= expected + Duration::from_millis(50),
        "expected ~{expected_ms}ms, got {actual:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_paces_the_retries() {
    let config = QueueConfig::new().retry(
        RetryPolicy::default()
            .exponent(2)
            .delay(500)
            .max_attempts(3u64),
    );
    let queue = JobQueue::with_config(config);
    let runs = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_worker(AlwaysFails { runs: runs.clone() })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    queue.enqueue::<AlwaysFails>(()).await.unwrap();
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Failed);

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 4, "initial run plus three retries");
    // Backoff between runs n and n+1 is n^2 * 500ms.
    assert_close(runs[1] - runs[0], 500);
    assert_close(runs[2] - runs[1], 2000);
    assert_close(runs[3] - runs[2], 4500);
}

#[tokio::test(start_paused = true)]
async fn no_retry_override_fails_after_a_single_run() {
    let queue = JobQueue::new();
    let runs = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_worker(AlwaysFails { runs: runs.clone() })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    queue
        .enqueue_opts::<AlwaysFails>((), EnqueueOptions::new().retry(RetryPolicy::no_retry()))
        .await
        .unwrap();

    assert_eq!(events.recv().await.unwrap().kind, EventKind::Failed);
    assert_eq!(runs.lock().unwrap().len(), 1);
}

#[derive(Clone)]
struct FailsOnce {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for FailsOnce {
    const NAME: &'static str = "fails_once";
    type Args = ();

    async fn invoke(&self, _ctx: JobContext, _args: ()) -> anyhow::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("transient failure");
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_retry() {
    let queue = JobQueue::new();
    let calls = Arc::new(AtomicUsize::new(0));
    queue
        .register_worker(FailsOnce {
            calls: calls.clone(),
        })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    queue.enqueue::<FailsOnce>(()).await.unwrap();

    assert_eq!(events.recv().await.unwrap().kind, EventKind::Finished);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(events.try_recv().is_none(), "exactly one terminal event");
}

#[derive(Clone)]
struct Panics;

#[async_trait]
impl Worker for Panics {
    const NAME: &'static str = "panics";
    type Args = ();

    async fn invoke(&self, _ctx: JobContext, _args: ()) -> anyhow::Result<()> {
        panic!("worker went sideways");
    }
}

#[tokio::test]
async fn panicking_worker_fails_without_taking_the_queue_down() {
    let queue = JobQueue::new();
    queue.register_worker(Panics).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_worker(Recorder { seen: seen.clone() })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    queue
        .enqueue_opts::<Panics>((), EnqueueOptions::new().retry(RetryPolicy::no_retry()))
        .await
        .unwrap();
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Failed);

    // The queue still schedules and runs jobs afterwards.
    queue.enqueue::<Recorder>(7).await.unwrap();
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Finished);
    assert_eq!(seen.lock().unwrap().as_slice(), &[7]);
}

#[tokio::test(start_paused = true)]
async fn delayed_job_waits_for_its_deadline() {
    let queue = JobQueue::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_worker(Recorder { seen: seen.clone() })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    let t0 = Instant::now();
    queue
        .enqueue_opts::<Recorder>(1, EnqueueOptions::new().delay_for(1000))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(seen.lock().unwrap().is_empty(), "ran before its deadline");

    assert_eq!(events.recv().await.unwrap().kind, EventKind::Finished);
    assert!(t0.elapsed() >= Duration::from_millis(1000));
    assert_eq!(seen.lock().unwrap().as_slice(), &[1]);
}

/// Single-slot variant of [`Gated`].
#[derive(Clone)]
struct GatedOne {
    starts: mpsc::UnboundedSender<u32>,
    gates: Arc<Vec<Semaphore>>,
}

#[async_trait]
impl Worker for GatedOne {
    const NAME: &'static str = "gated_one";
    type Args = u32;

    fn max_concurrent() -> Concurrency {
        Concurrency::Limit(1)
    }

    async fn invoke(&self, _ctx: JobContext, idx: u32) -> anyhow::Result<()> {
        let _ = self.starts.send(idx);
        let _permit = self.gates[idx as usize].acquire().await?;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn due_delayed_job_still_waits_for_a_free_slot() {
    let queue = JobQueue::new();
    let (tx, mut starts) = mpsc::unbounded_channel();
    let gates: Arc<Vec<Semaphore>> = Arc::new((0..2).map(|_| Semaphore::new(0)).collect());
    queue
        .register_worker(GatedOne {
            starts: tx,
            gates: gates.clone(),
        })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    queue.enqueue::<GatedOne>(0).await.unwrap();
    assert_eq!(starts.recv().await, Some(0));

    queue
        .enqueue_opts::<GatedOne>(1, EnqueueOptions::new().delay_for(100))
        .await
        .unwrap();

    // Well past the deadline the slot is still occupied.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(starts.try_recv().is_err());

    gates[0].add_permits(1);
    assert_eq!(starts.recv().await, Some(1));
    gates[1].add_permits(1);

    for _ in 0..2 {
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Finished);
    }
}

#[tokio::test(start_paused = true)]
async fn every_submission_gets_exactly_one_terminal_event() {
    let queue = JobQueue::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let runs = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_worker(Recorder { seen: seen.clone() })
        .await
        .unwrap();
    queue
        .register_worker(AlwaysFails { runs: runs.clone() })
        .await
        .unwrap();
    let mut events = queue.subscribe();

    let mut expected = Vec::new();
    for n in 0..3u32 {
        expected.push(queue.enqueue::<Recorder>(n).await.unwrap());
    }
    expected.push(
        queue
            .enqueue_opts::<AlwaysFails>((), EnqueueOptions::new().retry(RetryPolicy::no_retry()))
            .await
            .unwrap(),
    );

    let mut terminal = Vec::new();
    for _ in 0..expected.len() {
        let ev = events.recv().await.unwrap();
        terminal.push((ev.job.id.clone(), ev.kind));
    }
    settle().await;
    assert!(events.try_recv().is_none());

    let mut ids: Vec<_> = terminal.iter().map(|(id, _)| id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), expected.len(), "one terminal event per job");
    assert_eq!(
        terminal
            .iter()
            .filter(|(_, kind)| *kind == EventKind::Failed)
            .count(),
        1
    );
}
