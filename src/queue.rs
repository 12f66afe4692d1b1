//! Bounded job queues.
//!
//! Three fixed lanes, each with its own concurrency limit:
//! - `Bulk`: independent read-only discovery work
//! - `Moderate`: secondary reads against third-party APIs, throttled harder
//! - `Serial`: every write to the record store, one at a time
//!
//! Jobs are dispatched FIFO as slots free up; completion order within a
//! lane is whatever the I/O gives us. Each lane remembers the name of
//! every pending and running job so the pipeline can be inspected and so
//! batch runs can detect quiescence.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::JobError;
use crate::types::QueueConfig;

/// How often the quiescence detector samples the queues.
pub const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive empty samples required before a run is declared done.
/// A single zero is not enough: a job that just finished may enqueue a
/// follow-up right after the sample.
pub const QUIESCENCE_REQUIRED_ZEROS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    Bulk,
    Moderate,
    Serial,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Bulk, Lane::Moderate, Lane::Serial];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Bulk => "bulk",
            Lane::Moderate => "moderate",
            Lane::Serial => "serial",
        }
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'static>>;

struct PendingJob {
    id: Uuid,
    name: String,
    future: JobFuture,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingJob>,
    running: Vec<(Uuid, String)>,
}

/// Point-in-time view of one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub lane: Lane,
    pub concurrency: usize,
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    pub fn size(&self) -> usize {
        self.running.len() + self.pending.len()
    }
}

/// One concurrency-limited FIFO lane. Cloning shares the lane.
#[derive(Clone)]
pub struct JobQueue {
    lane: Lane,
    concurrency: usize,
    state: Arc<Mutex<QueueState>>,
}

impl JobQueue {
    pub fn new(lane: Lane, concurrency: usize) -> Self {
        Self {
            lane,
            concurrency: concurrency.max(1),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Accept a job immediately; it runs once a slot is free.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add<F>(&self, name: impl Into<String>, job: F)
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let name = name.into();
        log::debug!("Queue[{}]: enqueued '{}'", self.lane.as_str(), name);
        self.state.lock().pending.push_back(PendingJob {
            id: Uuid::new_v4(),
            name,
            future: Box::pin(job),
        });
        self.dispatch();
    }

    /// Start pending jobs until the lane is full or empty.
    fn dispatch(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                if state.running.len() >= self.concurrency {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.running.push((job.id, job.name.clone()));
                job
            };
            self.spawn(job);
        }
    }

    fn spawn(&self, job: PendingJob) {
        let queue = self.clone();
        let PendingJob { id, name, future } = job;
        tokio::spawn(async move {
            let started = Instant::now();
            // The job runs in its own task so a panic is caught here
            // instead of leaking the slot.
            match tokio::spawn(future).await {
                Ok(Ok(())) => log::debug!(
                    "Queue[{}]: '{}' done in {}ms",
                    queue.lane.as_str(),
                    name,
                    started.elapsed().as_millis()
                ),
                Ok(Err(e)) => log::warn!("Queue[{}]: '{}' failed: {}", queue.lane.as_str(), name, e),
                Err(e) if e.is_panic() => {
                    log::error!("Queue[{}]: '{}' panicked", queue.lane.as_str(), name)
                }
                Err(e) => log::warn!("Queue[{}]: '{}' cancelled: {}", queue.lane.as_str(), name, e),
            }
            queue.finish(id);
        });
    }

    fn finish(&self, id: Uuid) {
        self.state.lock().running.retain(|(job_id, _)| *job_id != id);
        self.dispatch();
    }

    /// Pending + running.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.running.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            lane: self.lane,
            concurrency: self.concurrency,
            running: state.running.iter().map(|(_, name)| name.clone()).collect(),
            pending: state.pending.iter().map(|job| job.name.clone()).collect(),
        }
    }
}

/// The three lanes, constructed once and injected wherever work is queued.
pub struct JobQueues {
    pub bulk: JobQueue,
    pub moderate: JobQueue,
    pub serial: JobQueue,
}

impl JobQueues {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            bulk: JobQueue::new(Lane::Bulk, config.bulk()),
            moderate: JobQueue::new(Lane::Moderate, config.moderate()),
            serial: JobQueue::new(Lane::Serial, config.serial()),
        }
    }

    pub fn lane(&self, lane: Lane) -> &JobQueue {
        match lane {
            Lane::Bulk => &self.bulk,
            Lane::Moderate => &self.moderate,
            Lane::Serial => &self.serial,
        }
    }

    pub fn add<F>(&self, lane: Lane, name: impl Into<String>, job: F)
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.lane(lane).add(name, job);
    }

    pub fn total_size(&self) -> usize {
        Lane::ALL.iter().map(|lane| self.lane(*lane).size()).sum()
    }

    pub fn snapshots(&self) -> Vec<QueueSnapshot> {
        Lane::ALL.iter().map(|lane| self.lane(*lane).snapshot()).collect()
    }

    /// One line per lane, e.g. `serial 1/1 running [ensure Q1 P2], 3 pending`.
    pub fn describe(&self) -> String {
        self.snapshots()
            .iter()
            .map(|s| {
                format!(
                    "{} {}/{} running [{}], {} pending",
                    s.lane.as_str(),
                    s.running.len(),
                    s.concurrency,
                    s.running.join(", "),
                    s.pending.len()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Block until every lane has been empty for
    /// `QUIESCENCE_REQUIRED_ZEROS` consecutive samples.
    pub async fn wait_for_quiescence(&self, poll_interval: Duration) {
        let sample = || {
            let total = self.total_size();
            if total > 0 {
                log::debug!("Queues: {} outstanding\n{}", total, self.describe());
            }
            total
        };
        wait_until_quiescent(sample, poll_interval, QUIESCENCE_REQUIRED_ZEROS).await;
        log::info!("Queues: quiescent");
    }
}

/// Consecutive-zero counter behind the quiescence detector.
#[derive(Debug)]
pub struct QuiescenceTracker {
    required: u32,
    consecutive_zeros: u32,
}

impl QuiescenceTracker {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            consecutive_zeros: 0,
        }
    }

    /// Record one sample; returns true once the run is quiescent.
    pub fn observe(&mut self, total: usize) -> bool {
        if total == 0 {
            self.consecutive_zeros += 1;
        } else {
            self.consecutive_zeros = 0;
        }
        self.consecutive_zeros >= self.required
    }
}

pub async fn wait_until_quiescent<F>(mut sample: F, poll_interval: Duration, required: u32)
where
    F: FnMut() -> usize,
{
    let mut tracker = QuiescenceTracker::new(required);
    loop {
        let total = sample();
        if tracker.observe(total) {
            return;
        }
        if total > 0 {
            log::debug!("Queues: {} job(s) outstanding", total);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[test]
    fn test_tracker_requires_three_consecutive_zeros() {
        let samples = [5, 5, 0, 0, 3, 0, 0, 0];
        let mut tracker = QuiescenceTracker::new(QUIESCENCE_REQUIRED_ZEROS);
        let results: Vec<bool> = samples.iter().map(|s| tracker.observe(*s)).collect();
        assert_eq!(
            results,
            vec![false, false, false, false, false, false, false, true]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_quiescent_ignores_short_zero_run() {
        let samples = [5usize, 5, 0, 0, 3, 0, 0, 0];
        let index = AtomicUsize::new(0);
        let sampler = || {
            let i = index.fetch_add(1, Ordering::SeqCst);
            samples[i.min(samples.len() - 1)]
        };

        wait_until_quiescent(sampler, Duration::from_secs(1), QUIESCENCE_REQUIRED_ZEROS).await;

        // Every sample was consumed: the zeros before the 3 did not end the wait
        assert_eq!(index.load(Ordering::SeqCst), samples.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_quiescent_stops_at_first_full_zero_run() {
        let samples = [5usize, 5, 0, 0, 0, 3, 0, 0, 0];
        let index = AtomicUsize::new(0);
        let sampler = || {
            let i = index.fetch_add(1, Ordering::SeqCst);
            samples[i.min(samples.len() - 1)]
        };

        wait_until_quiescent(sampler, Duration::from_secs(1), QUIESCENCE_REQUIRED_ZEROS).await;
        assert_eq!(index.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_fifo() {
        let queue = JobQueue::new(Lane::Moderate, 2);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut releases = Vec::new();

        for i in 0..4 {
            let (tx, rx) = oneshot::channel::<()>();
            releases.push(tx);
            let order = order.clone();
            queue.add(format!("job-{}", i), async move {
                order.lock().push(i);
                let _ = rx.await;
                Ok(())
            });
        }

        tokio::task::yield_now().await;
        wait_for(|| order.lock().len() == 2).await;

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.running, vec!["job-0", "job-1"]);
        assert_eq!(snapshot.pending, vec!["job-2", "job-3"]);
        assert_eq!(queue.size(), 4);

        for tx in releases {
            let _ = tx.send(());
        }
        wait_for(|| queue.size() == 0).await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_jobs_release_slot() {
        let queue = JobQueue::new(Lane::Serial, 1);
        let ran = Arc::new(AtomicUsize::new(0));

        queue.add("fails", async { Err(JobError::DataShape("missing field".into())) });
        queue.add("panics", async {
            let missing: Option<()> = None;
            missing.expect("job panicked");
            Ok(())
        });
        let counter = ran.clone();
        queue.add("succeeds", async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        wait_for(|| queue.size() == 0).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queues_use_config_with_fallback() {
        let config = QueueConfig {
            bulk_concurrency: Some(0),
            moderate_concurrency: Some(-3),
            serial_concurrency: None,
        };
        let queues = JobQueues::new(&config);
        assert_eq!(queues.bulk.concurrency(), 4);
        assert_eq!(queues.moderate.concurrency(), 2);
        assert_eq!(queues.serial.concurrency(), 1);
        assert_eq!(queues.total_size(), 0);
        assert!(queues.describe().contains("serial 0/1 running"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_quiescence_outlasts_named_job() {
        let queues = JobQueues::new(&QueueConfig::default());
        queues.add(Lane::Serial, "ensure Q1 P2", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        assert!(queues.describe().contains("serial 1/1 running [ensure Q1 P2]"));

        queues.wait_for_quiescence(Duration::from_millis(10)).await;

        assert_eq!(queues.total_size(), 0);
    }

    #[tokio::test]
    async fn test_job_enqueued_by_job_keeps_queues_busy() {
        let queues = Arc::new(JobQueues::new(&QueueConfig::default()));
        let done = Arc::new(AtomicUsize::new(0));

        let inner_queues = queues.clone();
        let inner_done = done.clone();
        queues.add(Lane::Bulk, "parent", async move {
            inner_queues.add(Lane::Serial, "child", async move {
                inner_done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        queues.wait_for_quiescence(Duration::from_millis(10)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not met in time");
    }
}
