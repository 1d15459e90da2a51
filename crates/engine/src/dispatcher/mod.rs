//! Job Dispatcher: an in-process priority queue plus a bounded worker
//! pool with dependency gating.
//!
//! A remote-queue design (rows claimed with `SELECT ... SKIP LOCKED`)
//! exists to coordinate a fleet of independent worker processes across
//! hosts. This engine runs a single process, so the queue itself can live
//! in memory: a `BinaryHeap` guarded by a `tokio::sync::Mutex`, with idle
//! workers parked on a `Notify` instead of polling a database on an
//! interval. The backpressure watermark/hysteresis state and the
//! `watch`-channel-plus-`Semaphore` graceful shutdown are shared with the
//! worker pool.
//!
//! Every blocking `Action`, `Parallel` branch and `Race` branch the
//! Interpreter asks the Run Coordinator to execute is submitted here as a
//! [`Job`] and awaited through [`JobDispatcher::wait_for`] — the
//! Coordinator's [`crate::interpreter::StepExecutor`] implementation never
//! calls a handler directly.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::model::{Job, JobId, JobState, RunId};
use crate::reliability::ExecutionResult;
use crate::worker::{BackpressureConfig, BackpressureState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub max_concurrency: usize,
    pub backpressure: BackpressureConfig,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        d.as_millis().serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            ..Default::default()
        }
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("dispatcher queue is full (backpressure)")]
    QueueFull,

    #[error("dispatcher is not running")]
    NotRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    #[error("job execution failed: {0}")]
    JobFailed(String),
}

/// Queue entry ordered by `(priority desc, enqueued_at asc)` so that
/// higher-priority jobs dequeue first and ties break FIFO.
struct QueueEntry {
    job: Job,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.job.id == other.job.id
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.enqueued_at.cmp(&self.job.enqueued_at))
    }
}

/// Callback invoked by a worker to actually execute a dequeued job and
/// report back the same success/output/error/attempts shape the
/// Execution Envelope produces. The Dispatcher itself has no notion of
/// handlers, steps or workflows — it is purely a scheduling primitive;
/// the Coordinator supplies the closure that drives the Interpreter.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: Job) -> std::pin::Pin<Box<dyn Future<Output = ExecutionResult<Value>> + Send>>;
}

impl<F, Fut> JobRunner for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult<Value>> + Send + 'static,
{
    fn run(&self, job: Job) -> std::pin::Pin<Box<dyn Future<Output = ExecutionResult<Value>> + Send>> {
        Box::pin(self(job))
    }
}

struct QueueState {
    heap: BinaryHeap<QueueEntry>,
}

/// Priority queue + bounded worker pool. `submit` enqueues a job
/// (subject to backpressure); once all of a job's `dependencies` are in
/// `completed`, a worker dequeues and executes it via the configured
/// [`JobRunner`]. `wait_for` resolves once that job's result is in.
pub struct JobDispatcher {
    config: DispatcherConfig,
    queue: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    completed: Arc<DashSet<JobId>>,
    /// Latest known state of every job this dispatcher has ever seen,
    /// mutated as it moves through `Pending -> Running -> {terminal}`.
    jobs: Arc<DashMap<JobId, Job>>,
    /// One-shot result channel per in-flight job, consumed by `wait_for`.
    result_txs: Arc<DashMap<JobId, oneshot::Sender<ExecutionResult<Value>>>>,
    backpressure: Arc<BackpressureState>,
    active_tasks: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    total_submitted: Arc<AtomicU64>,
    total_completed: Arc<AtomicU64>,
    total_failed: Arc<AtomicU64>,
    total_timed_out: Arc<AtomicU64>,
    total_cancelled: Arc<AtomicU64>,
}

impl JobDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));
        Self {
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            queue: Arc::new(Mutex::new(QueueState {
                heap: BinaryHeap::new(),
            })),
            notify: Arc::new(Notify::new()),
            completed: Arc::new(DashSet::new()),
            jobs: Arc::new(DashMap::new()),
            result_txs: Arc::new(DashMap::new()),
            backpressure,
            shutdown_tx,
            shutdown_rx,
            worker_handles: std::sync::Mutex::new(Vec::new()),
            total_submitted: Arc::new(AtomicU64::new(0)),
            total_completed: Arc::new(AtomicU64::new(0)),
            total_failed: Arc::new(AtomicU64::new(0)),
            total_timed_out: Arc::new(AtomicU64::new(0)),
            total_cancelled: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a job. Rejected with [`DispatcherError::QueueFull`] while
    /// backpressure is active. Returns the job id plus the receiver
    /// `wait_for` resolves once a worker has run it to completion.
    #[instrument(skip(self, job), fields(job_id = %job.id, step = %job.step_name))]
    pub async fn submit(&self, job: Job) -> Result<(JobId, oneshot::Receiver<ExecutionResult<Value>>), DispatcherError> {
        if !self.backpressure.should_accept() {
            return Err(DispatcherError::QueueFull);
        }
        let job_id = job.id;
        let (tx, rx) = oneshot::channel();
        self.result_txs.insert(job_id, tx);
        self.jobs.insert(job_id, job.clone());
        self.total_submitted.fetch_add(1, AtomicOrdering::Relaxed);

        self.queue.lock().await.heap.push(QueueEntry { job });
        self.notify.notify_one();
        Ok((job_id, rx))
    }

    /// Await a submitted job's result. A dropped sender (the worker pool
    /// was shut down, or the job was cancelled and its sender already
    /// consumed) surfaces as [`DispatcherError::JobFailed`].
    pub async fn wait_for(
        &self,
        rx: oneshot::Receiver<ExecutionResult<Value>>,
    ) -> Result<ExecutionResult<Value>, DispatcherError> {
        rx.await.map_err(|_| DispatcherError::JobFailed("job result channel closed before completion".to_string()))
    }

    /// The dispatcher's current view of a job, if it has been submitted.
    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.get(&job_id).map(|entry| entry.clone())
    }

    /// Mark a job completed so that any queued job depending on it
    /// becomes eligible. Workers call this automatically after a
    /// successful run; callers only need it when driving the dispatcher
    /// directly (e.g. tests).
    pub fn mark_completed(&self, job_id: JobId) {
        self.completed.insert(job_id);
        self.notify.notify_waiters();
    }

    /// Drop every queued-but-not-yet-started job belonging to `run_id`,
    /// marking each `Cancelled` and resolving any `wait_for` caller with a
    /// cancelled result. Jobs already claimed by a worker keep running to
    /// completion — cooperative cancellation of an in-flight handler is
    /// the Context's cancellation token's job, not the queue's.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: RunId) {
        let mut state = self.queue.lock().await;
        let entries: Vec<QueueEntry> = state.heap.drain().collect();
        let mut kept = BinaryHeap::new();

        for entry in entries {
            if entry.job.run_id != run_id {
                kept.push(entry);
                continue;
            }

            let job_id = entry.job.id;
            let mut cancelled = entry.job;
            cancelled.state = JobState::Cancelled;
            cancelled.completed_at = Some(Utc::now());
            self.jobs.insert(job_id, cancelled);
            self.total_cancelled.fetch_add(1, AtomicOrdering::Relaxed);

            if let Some((_, tx)) = self.result_txs.remove(&job_id) {
                let _ = tx.send(ExecutionResult {
                    success: false,
                    output: None,
                    error: Some("run was cancelled".to_string()),
                    attempts: 0,
                    total_duration: Duration::ZERO,
                    retry_delays: Vec::new(),
                });
            }
        }

        state.heap = kept;
        drop(state);
        self.notify.notify_waiters();
    }

    fn dependencies_satisfied(&self, job: &Job) -> bool {
        job.dependencies.iter().all(|dep| self.completed.contains(dep))
    }

    /// Spawn `worker_count` worker loops that pull eligible jobs and run
    /// them through `runner`, recording each job's `Running`/terminal
    /// transition and its stats counter as it goes.
    pub fn start<R: JobRunner>(&self, worker_count: usize, runner: Arc<R>) {
        let mut handles = self.worker_handles.lock().unwrap();
        for _ in 0..worker_count {
            let queue = self.queue.clone();
            let notify = self.notify.clone();
            let completed = self.completed.clone();
            let jobs = self.jobs.clone();
            let result_txs = self.result_txs.clone();
            let backpressure = self.backpressure.clone();
            let active_tasks = self.active_tasks.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            let runner = runner.clone();
            let total_completed = self.total_completed.clone();
            let total_failed = self.total_failed.clone();
            let total_timed_out = self.total_timed_out.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        return;
                    }

                    let job = {
                        let mut state = queue.lock().await;
                        let mut deferred = Vec::new();
                        let mut ready = None;
                        while let Some(entry) = state.heap.pop() {
                            let satisfied = entry
                                .job
                                .dependencies
                                .iter()
                                .all(|dep| completed.contains(dep));
                            if satisfied {
                                ready = Some(entry.job);
                                break;
                            }
                            deferred.push(entry);
                        }
                        for entry in deferred {
                            state.heap.push(entry);
                        }
                        ready
                    };

                    let Some(job) = job else {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    return;
                                }
                            }
                        }
                        continue;
                    };

                    let permit = match active_tasks.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    backpressure.task_started();
                    let job_id = job.id;

                    let mut running = job.clone();
                    running.state = JobState::Running;
                    running.started_at = Some(Utc::now());
                    jobs.insert(job_id, running.clone());

                    let outcome = runner.run(job).await;
                    backpressure.task_completed();
                    drop(permit);

                    let mut finished = running;
                    finished.completed_at = Some(Utc::now());
                    finished.attempt_count = outcome.attempts;
                    finished.last_error = outcome.error.clone();
                    finished.state = if outcome.success {
                        JobState::Completed
                    } else if outcome
                        .error
                        .as_deref()
                        .map(|e| e.to_lowercase().contains("timed out"))
                        .unwrap_or(false)
                    {
                        JobState::TimedOut
                    } else {
                        JobState::Failed
                    };
                    jobs.insert(job_id, finished.clone());

                    if outcome.success {
                        completed.insert(job_id);
                        total_completed.fetch_add(1, AtomicOrdering::Relaxed);
                    } else if finished.state == JobState::TimedOut {
                        total_timed_out.fetch_add(1, AtomicOrdering::Relaxed);
                    } else {
                        total_failed.fetch_add(1, AtomicOrdering::Relaxed);
                        if let Some(error) = &outcome.error {
                            warn!(%job_id, %error, "job failed");
                        }
                    }

                    if let Some((_, tx)) = result_txs.remove(&job_id) {
                        let _ = tx.send(outcome);
                    }
                    notify.notify_waiters();
                }
            }));
        }
    }

    /// Signal shutdown and wait (up to `shutdown_timeout`) for all
    /// in-flight jobs to finish.
    pub async fn shutdown(&self) -> Result<(), DispatcherError> {
        let _ = self.shutdown_tx.send(true);
        self.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.worker_handles.lock().unwrap();
            guard.drain(..).collect()
        };
        let join_all = futures::future::join_all(handles);
        match tokio::time::timeout(self.config.shutdown_timeout, join_all).await {
            Ok(_) => {
                debug!("dispatcher shut down cleanly");
                Ok(())
            }
            Err(_) => Err(DispatcherError::ShutdownTimeout),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            current_load: self.backpressure.current_load(),
            max_concurrency: self.backpressure.max_concurrency(),
            accepting: self.backpressure.is_accepting(),
            total_submitted: self.total_submitted.load(AtomicOrdering::Relaxed),
            total_completed: self.total_completed.load(AtomicOrdering::Relaxed),
            total_failed: self.total_failed.load(AtomicOrdering::Relaxed),
            total_timed_out: self.total_timed_out.load(AtomicOrdering::Relaxed),
            total_cancelled: self.total_cancelled.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub current_load: usize,
    pub max_concurrency: usize,
    pub accepting: bool,
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub total_cancelled: u64,
}
