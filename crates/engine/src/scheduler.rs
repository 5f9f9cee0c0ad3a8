//! Priority scheduler
//!
//! Tasks wait in a max-heap keyed by priority, ties broken by submission
//! order. A dispatcher loop hands them to a fixed-size worker pool (a
//! semaphore), and each worker drives one [`RendererBackend::execute`].
//! Every terminal transition goes through one place, which updates the
//! metrics, runs the completion callback and publishes the event.

use crate::cache::HybridCache;
use crate::concurrency::WorkerPlan;
use crate::config::{Config, EncodingConfig};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::{MetricsAggregate, PerformanceMetrics, QueueStatus};
use crate::render::{RenderError, RenderJob, RenderOutcome, RendererBackend};
use crate::task::{
    unix_timestamp_ms, CompletionCallback, FailureKind, Operation, TaskFailure, TaskId,
    TaskRecord, TaskRequest, TaskStatus,
};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for task submission
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Queue is full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },

    #[error("Task registry is full ({capacity} tasks tracked)")]
    RegistryFull { capacity: usize },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Heap entry; the record itself lives in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedTask {
    priority: i32,
    seq: u64,
    id: TaskId,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TaskEntry {
    record: TaskRecord,
    encoding: Option<EncodingConfig>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    callback: Option<CompletionCallback>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_queue_size: usize,
    max_registry_size: usize,
    max_retained_tasks: usize,
    retain_after_trim: usize,
}

struct Registry {
    tasks: HashMap<TaskId, TaskEntry>,
    queue: BinaryHeap<QueuedTask>,
    next_seq: u64,
    /// Terminal tasks, oldest first
    finished: VecDeque<TaskId>,
    accepting: bool,
}

impl Registry {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
            finished: VecDeque::new(),
            accepting: true,
        }
    }

    /// Move a task into a terminal status
    ///
    /// Returns the final record and its callback, or `None` when the
    /// transition is not allowed (already terminal, unknown id).
    fn finish(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        error: Option<TaskFailure>,
        outcome: Option<RenderOutcome>,
        limits: &Limits,
    ) -> Option<(TaskRecord, Option<CompletionCallback>)> {
        let entry = self.tasks.get_mut(&id)?;
        if !entry.record.status.can_transition_to(status) {
            debug!(task_id = %id, from = %entry.record.status, to = %status, "Ignoring late transition");
            return None;
        }

        entry.record.status = status;
        entry.record.completed_at_ms = Some(unix_timestamp_ms());
        entry.record.error = error;
        entry.record.outcome = outcome;
        if status == TaskStatus::Completed {
            entry.record.progress = 1.0;
        }
        let callback = entry.callback.take();
        let record = entry.record.clone();

        self.finished.push_back(id);
        self.trim(limits);
        Some((record, callback))
    }

    fn trim(&mut self, limits: &Limits) {
        if self.finished.len() <= limits.max_retained_tasks {
            return;
        }
        let before = self.finished.len();
        while self.finished.len() > limits.retain_after_trim {
            if let Some(old) = self.finished.pop_front() {
                self.tasks.remove(&old);
            }
        }
        debug!(dropped = before - self.finished.len(), "Trimmed finished tasks");
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks
            .values()
            .filter(|e| e.record.status == status)
            .count()
    }
}

/// A fixed number of worker slots
struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: u32,
}

impl WorkerPool {
    fn new(size: u32) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size as usize)),
            size,
        })
    }
}

/// A task taken off the queue, ready for a worker
struct Dispatched {
    job: RenderJob,
    cancel: CancellationToken,
    preview_key: Option<String>,
}

struct Inner {
    registry: Mutex<Registry>,
    limits: Limits,
    pool: Mutex<Arc<WorkerPool>>,
    /// Serializes pool swaps and shutdown
    resize_lock: tokio::sync::Mutex<()>,
    paused: AtomicBool,
    started: AtomicBool,
    wake: Notify,
    /// Fired after every terminal transition
    idle: Notify,
    shutdown: CancellationToken,
    threads_per_task: AtomicU32,
    defaults: EncodingConfig,
    backend: Arc<RendererBackend>,
    cache: Arc<HybridCache>,
    events: EventBus,
    aggregate: Mutex<MetricsAggregate>,
}

/// Priority scheduler over a resizable worker pool
///
/// Cloning is cheap; clones share the same queue and pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        plan: &WorkerPlan,
        backend: Arc<RendererBackend>,
        cache: Arc<HybridCache>,
        events: EventBus,
    ) -> Self {
        let limits = Limits {
            max_queue_size: config.engine.max_queue_size,
            max_registry_size: config.engine.max_registry_size,
            max_retained_tasks: config.engine.max_retained_tasks,
            retain_after_trim: config.engine.retain_after_trim,
        };
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::new()),
                limits,
                pool: Mutex::new(WorkerPool::new(plan.pool_size)),
                resize_lock: tokio::sync::Mutex::new(()),
                paused: AtomicBool::new(false),
                started: AtomicBool::new(false),
                wake: Notify::new(),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                threads_per_task: AtomicU32::new(plan.threads_per_task),
                defaults: config.encoding.clone(),
                backend,
                cache,
                events,
                aggregate: Mutex::new(MetricsAggregate::new()),
            }),
        }
    }

    /// Spawn the dispatcher loop
    ///
    /// Tasks submitted before this call wait in the queue. Returns `None`
    /// when the dispatcher is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already started");
            return None;
        }
        let inner = self.inner.clone();
        info!(pool_size = self.pool_size(), "Starting scheduler");
        Some(tokio::spawn(inner.dispatch_loop()))
    }

    /// Queue a task
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
        let limits = &self.inner.limits;
        let id = {
            let mut reg = self.inner.registry.lock();
            if !reg.accepting {
                return Err(SubmitError::ShuttingDown);
            }
            if reg.queue.len() >= limits.max_queue_size {
                return Err(SubmitError::QueueFull {
                    capacity: limits.max_queue_size,
                });
            }
            if reg.tasks.len() >= limits.max_registry_size {
                return Err(SubmitError::RegistryFull {
                    capacity: limits.max_registry_size,
                });
            }

            let id = TaskId::new();
            let record = TaskRecord {
                id,
                name: request.display_name(),
                operation: request.operation,
                input_path: request.input_path,
                output_path: request.output_path,
                priority: request.priority,
                // Admission happens under the registry lock, so the task
                // is never observable as Pending
                status: TaskStatus::Queued,
                progress: 0.0,
                created_at_ms: unix_timestamp_ms(),
                started_at_ms: None,
                completed_at_ms: None,
                error: None,
                outcome: None,
            };

            let seq = reg.next_seq;
            reg.next_seq += 1;
            reg.queue.push(QueuedTask {
                priority: record.priority,
                seq,
                id,
            });
            debug!(task_id = %id, name = %record.name, priority = record.priority, "Task queued");
            reg.tasks.insert(
                id,
                TaskEntry {
                    record,
                    encoding: request.encoding,
                    timeout: request.timeout,
                    cancel: CancellationToken::new(),
                    callback: request.callback,
                },
            );
            id
        };

        self.inner.aggregate.lock().record_submitted();
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Cancel a task
    ///
    /// Waiting tasks become `Cancelled` immediately. A running task has its
    /// process killed and becomes `Cancelled` once the worker observes it.
    /// Returns `false` for unknown or already finished tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        let finished = {
            let mut reg = self.inner.registry.lock();
            let Some(status) = reg.tasks.get(&id).map(|e| e.record.status) else {
                return false;
            };
            match status {
                TaskStatus::Pending | TaskStatus::Queued => {
                    reg.queue.retain(|q| q.id != id);
                    reg.finish(id, TaskStatus::Cancelled, None, None, &self.inner.limits)
                }
                TaskStatus::Processing => {
                    if let Some(entry) = reg.tasks.get(&id) {
                        entry.cancel.cancel();
                    }
                    info!(task_id = %id, "Cancelling running task");
                    return true;
                }
                _ => return false,
            }
        };
        match finished {
            Some((record, callback)) => {
                info!(task_id = %id, "Cancelled queued task");
                self.inner.announce(record, callback);
                true
            }
            None => false,
        }
    }

    /// Current record of a task, if it is still tracked
    pub fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.inner
            .registry
            .lock()
            .tasks
            .get(&id)
            .map(|e| e.record.clone())
    }

    /// All tracked tasks, oldest first
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .registry
            .lock()
            .tasks
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at_ms);
        records
    }

    /// Tasks currently held by a worker
    pub fn active_tasks(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .registry
            .lock()
            .tasks
            .values()
            .filter(|e| e.record.status == TaskStatus::Processing)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by_key(|r| r.started_at_ms);
        records
    }

    /// Wait until nothing is queued or running
    ///
    /// Returns `false` if `timeout` elapsed first. Tasks submitted while
    /// waiting extend the wait.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let wait = async {
            loop {
                let notified = inner.idle.notified();
                tokio::pin!(notified);
                // Register before checking so a completion in between is not missed
                notified.as_mut().enable();
                if inner.is_idle() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Drop every terminal task from the registry
    pub fn clear_completed_tasks(&self) -> usize {
        let mut reg = self.inner.registry.lock();
        let before = reg.tasks.len();
        reg.tasks.retain(|_, e| !e.record.status.is_terminal());
        reg.finished.clear();
        let removed = before - reg.tasks.len();
        debug!(removed, "Cleared finished tasks");
        removed
    }

    pub fn pool_size(&self) -> u32 {
        self.inner.pool.lock().size
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let pool = self.inner.pool.lock().clone();
        let reg = self.inner.registry.lock();
        QueueStatus {
            pending: reg.count(TaskStatus::Pending),
            queued: reg.count(TaskStatus::Queued),
            processing: reg.count(TaskStatus::Processing),
            completed: reg.count(TaskStatus::Completed),
            failed: reg.count(TaskStatus::Failed),
            cancelled: reg.count(TaskStatus::Cancelled),
            total_tracked: reg.tasks.len(),
            pool_size: pool.size,
            available_workers: pool.semaphore.available_permits(),
            max_queue_size: self.inner.limits.max_queue_size,
            accepting: reg.accepting,
        }
    }

    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        self.inner
            .aggregate
            .lock()
            .snapshot(Instant::now(), self.inner.backend.spawned_count())
    }

    /// Replace the worker pool with one of `size` slots
    ///
    /// Dispatch pauses and running tasks finish on the old pool before the
    /// new one takes over; nothing is cancelled.
    pub async fn resize_pool(&self, size: u32, threads_per_task: u32) {
        let _guard = self.inner.resize_lock.lock().await;
        let size = size.max(1);
        let old = self.inner.pool.lock().clone();
        if old.size == size {
            self.inner
                .threads_per_task
                .store(threads_per_task.max(1), Ordering::SeqCst);
            return;
        }

        self.inner.paused.store(true, Ordering::SeqCst);
        debug!(from = old.size, to = size, "Draining worker pool");
        match old.semaphore.acquire_many(old.size).await {
            Ok(permits) => permits.forget(),
            Err(_) => warn!("Worker pool closed during resize"),
        }

        *self.inner.pool.lock() = WorkerPool::new(size);
        old.semaphore.close();
        self.inner
            .threads_per_task
            .store(threads_per_task.max(1), Ordering::SeqCst);
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
        info!(from = old.size, to = size, threads_per_task, "Worker pool resized");
    }

    /// Stop accepting work and wind down
    ///
    /// Waiting tasks are cancelled. Running tasks are allowed to finish, or
    /// are cancelled too when `cancel_running` is set. Returns once no task
    /// is running and the dispatcher has stopped.
    pub async fn shutdown(&self, cancel_running: bool) {
        let waiting: Vec<TaskId> = {
            let mut reg = self.inner.registry.lock();
            if !reg.accepting && self.inner.shutdown.is_cancelled() {
                return;
            }
            reg.accepting = false;
            if cancel_running {
                for entry in reg.tasks.values() {
                    if entry.record.status == TaskStatus::Processing {
                        entry.cancel.cancel();
                    }
                }
            }
            reg.tasks
                .values()
                .filter(|e| matches!(e.record.status, TaskStatus::Pending | TaskStatus::Queued))
                .map(|e| e.record.id)
                .collect()
        };
        info!(cancelled = waiting.len(), cancel_running, "Shutting down scheduler");
        for id in waiting {
            self.cancel(id);
        }

        let _guard = self.inner.resize_lock.lock().await;
        self.inner.paused.store(true, Ordering::SeqCst);
        let pool = self.inner.pool.lock().clone();
        if let Ok(permits) = pool.semaphore.acquire_many(pool.size).await {
            permits.forget();
        }
        pool.semaphore.close();
        self.inner.shutdown.cancel();
        info!("Scheduler stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.registry.lock().accepting
    }
}

impl Inner {
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if !self.wait_for_work().await {
                break;
            }

            let pool = self.pool.lock().clone();
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = pool.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Pool replaced while waiting
                    Err(_) => continue,
                },
            };
            if self.paused.load(Ordering::SeqCst) {
                drop(permit);
                continue;
            }
            let Some(task) = self.take_next() else {
                continue;
            };

            let task_id = task.job.task_id;
            info!(task_id = %task_id, kind = %task.job.operation.kind(), "Task started");
            self.events.publish(EngineEvent::TaskStarted { task_id });

            let inner = self.clone();
            tokio::spawn(async move {
                let worker = inner.clone();
                inner
                    .contain(task_id, async move { worker.run(task).await })
                    .await;
                drop(permit);
            });
        }
        debug!("Dispatcher stopped");
    }

    /// Wait until a task is queued and dispatch is allowed; `false` on shutdown
    async fn wait_for_work(&self) -> bool {
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if !self.paused.load(Ordering::SeqCst) && !self.registry.lock().queue.is_empty() {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.wake.notified() => {}
            }
        }
    }

    fn take_next(&self) -> Option<Dispatched> {
        let mut reg = self.registry.lock();
        while let Some(next) = reg.queue.pop() {
            let Some(entry) = reg.tasks.get_mut(&next.id) else {
                continue;
            };
            if entry.record.status != TaskStatus::Queued {
                continue;
            }
            entry.record.status = TaskStatus::Processing;
            entry.record.started_at_ms = Some(unix_timestamp_ms());

            let mut encoding = entry
                .encoding
                .clone()
                .unwrap_or_else(|| self.defaults.clone());
            if encoding.threads == 0 {
                encoding.threads = self.threads_per_task.load(Ordering::SeqCst);
            }
            let record = &entry.record;
            return Some(Dispatched {
                preview_key: preview_key(&record.operation, &record.input_path),
                job: RenderJob {
                    task_id: record.id,
                    operation: record.operation.clone(),
                    input_path: record.input_path.clone(),
                    output_path: record.output_path.clone(),
                    encoding,
                    timeout: entry.timeout,
                },
                cancel: entry.cancel.clone(),
            });
        }
        None
    }

    /// Drive `work` on its own task; a panic fails the task instead of
    /// leaving it in `Processing`
    async fn contain<F>(&self, task_id: TaskId, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = tokio::spawn(work).await {
            if e.is_panic() {
                error!(task_id = %task_id, "Worker panicked");
                self.complete(
                    task_id,
                    Err(RenderError::Internal("worker panicked".to_string())),
                );
            }
        }
    }

    async fn run(&self, task: Dispatched) {
        let result = match &task.preview_key {
            Some(key) => self.run_preview(&task, key).await,
            None => self.render(&task).await,
        };
        self.complete(task.job.task_id, result);
    }

    async fn render(&self, task: &Dispatched) -> Result<RenderOutcome, RenderError> {
        let task_id = task.job.task_id;
        self.backend
            .execute(&task.job, &task.cancel, |progress| {
                self.report_progress(task_id, progress)
            })
            .await
    }

    /// Previews are served from the cache when possible and stored after a render
    async fn run_preview(&self, task: &Dispatched, key: &str) -> Result<RenderOutcome, RenderError> {
        let started = std::time::Instant::now();
        if task.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        if let Some(bytes) = self.cache.get(key).await {
            match write_output(&task.job.output_path, &bytes).await {
                Ok(()) => {
                    debug!(task_id = %task.job.task_id, key, "Preview served from cache");
                    self.report_progress(task.job.task_id, 1.0);
                    return Ok(RenderOutcome::from_cache(started.elapsed().as_millis() as u64));
                }
                Err(e) => warn!(error = %e, "Could not write cached preview, rendering instead"),
            }
        }

        let outcome = self.render(task).await?;
        match tokio::fs::read(&task.job.output_path).await {
            Ok(bytes) => self.cache.put(key, bytes).await,
            Err(e) => debug!(error = %e, "Preview output not cacheable"),
        }
        Ok(outcome)
    }

    fn report_progress(&self, task_id: TaskId, progress: f32) {
        let progress = progress.clamp(0.0, 1.0);
        {
            let mut reg = self.registry.lock();
            let Some(entry) = reg.tasks.get_mut(&task_id) else {
                return;
            };
            if entry.record.status != TaskStatus::Processing || progress <= entry.record.progress {
                return;
            }
            entry.record.progress = progress;
        }
        self.events
            .publish(EngineEvent::TaskProgress { task_id, progress });
    }

    /// Terminal transition for a task a worker ran
    fn complete(&self, id: TaskId, result: Result<RenderOutcome, RenderError>) {
        let finished = {
            let mut reg = self.registry.lock();
            let cancelled = reg
                .tasks
                .get(&id)
                .map(|e| e.cancel.is_cancelled())
                .unwrap_or(false);

            let (status, error, outcome) = match result {
                // A cancel request wins even if ffmpeg managed to exit cleanly
                _ if cancelled => (TaskStatus::Cancelled, None, None),
                Ok(outcome) => (TaskStatus::Completed, None, Some(outcome)),
                Err(RenderError::Cancelled) => (TaskStatus::Cancelled, None, None),
                Err(err) => (TaskStatus::Failed, Some(err.to_failure()), None),
            };
            reg.finish(id, status, error, outcome, &self.limits)
        };

        if let Some((record, callback)) = finished {
            match (&record.status, &record.error) {
                (TaskStatus::Failed, Some(failure)) => {
                    warn!(task_id = %id, kind = failure.kind.as_str(), error = %failure.message, "Task failed")
                }
                (status, _) => info!(task_id = %id, status = %status, "Task finished"),
            }
            self.announce(record, callback);
        }
    }

    /// Metrics, callback, event; in that order and outside the registry lock
    fn announce(&self, record: TaskRecord, callback: Option<CompletionCallback>) {
        self.aggregate.lock().record_terminal(&record, Instant::now());

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                error!(task_id = %record.id, "Completion callback panicked");
            }
        }

        let task_id = record.id;
        let event = match record.status {
            TaskStatus::Completed => EngineEvent::TaskCompleted {
                task_id,
                outcome: record.outcome,
            },
            TaskStatus::Failed => EngineEvent::TaskFailed {
                task_id,
                error: record
                    .error
                    .unwrap_or_else(|| TaskFailure::new(FailureKind::Internal, "no error recorded")),
            },
            _ => EngineEvent::TaskCancelled { task_id },
        };
        self.events.publish(event);
        self.idle.notify_waiters();
    }

    fn is_idle(&self) -> bool {
        let reg = self.registry.lock();
        reg.queue.is_empty() && reg.count(TaskStatus::Processing) == 0
    }
}

/// Cache key for operations whose output is a reusable preview
fn preview_key(operation: &Operation, input: &Path) -> Option<String> {
    if !operation.is_preview() {
        return None;
    }
    let params = serde_json::to_string(operation).ok()?;
    Some(format!("{}:{}", input.display(), params))
}

async fn write_output(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}
