//! Orbital task scheduler: priority dispatch, conditional triggers, TMR
//! execution, retry/recovery handling, and recurring relaunch.
//!
//! Two long-lived workers run while the scheduler is started: the execution
//! worker drains the priority heap, and the condition worker scans the
//! conditional list once per tick. Task payloads are synchronous; they do
//! not yield back to the scheduler until they return.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::task::{
    OrbitPosition, RecoveryStrategy, Task, TaskContext, TaskPriority, TaskResult, TaskSnapshot,
    TaskStatus, TaskType, TriggerCondition,
};

/// How long the execution worker parks when the head of the heap is still in
/// the future, and the upper bound on condvar waits so shutdown is prompt.
const DISPATCH_PARK_MS: u64 = 100;

/// Default conditional-evaluation tick.
const CONDITION_TICK_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    NotRunning,
    TaskNotFound,
    InvalidTransition,
}

impl core::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedulerError::NotRunning => write!(f, "scheduler not running"),
            SchedulerError::TaskNotFound => write!(f, "task not found"),
            SchedulerError::InvalidTransition => write!(f, "invalid task state transition"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Scheduler metrics snapshot. The census is keyed by status name so the
/// structure survives JSON telemetry encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub radiation_events: u64,
    pub census: BTreeMap<String, usize>,
}

impl SchedulerMetrics {
    pub fn census_count(&self, status: TaskStatus) -> usize {
        self.census
            .get(&format!("{:?}", status))
            .copied()
            .unwrap_or(0)
    }
}

/// Live task record. Shared between the task map, the heap, and the
/// conditional list; its own mutex is the innermost lock in the system.
struct TaskEntry {
    task: Task,
    status: TaskStatus,
    actual_start: Option<SystemTime>,
    actual_end: Option<SystemTime>,
    error_message: String,
    retries_used: u32,
    output: BTreeMap<String, String>,
    recurring_interval: Option<Duration>,
    radiation_event: bool,
}

type SharedEntry = Arc<Mutex<TaskEntry>>;

/// Heap element. The ordering key is snapshotted at push time so comparisons
/// never need the entry lock.
struct QueuedTask {
    priority: TaskPriority,
    scheduled_time: SystemTime,
    seq: u64,
    entry: SharedEntry,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == core::cmp::Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key (highest
        // priority, earliest time, first inserted) surfaces at the top.
        (other.priority, other.scheduled_time, other.seq).cmp(&(
            self.priority,
            self.scheduled_time,
            self.seq,
        ))
    }
}

/// Conditional-list element.
struct ConditionalEntry {
    entry: SharedEntry,
    trigger: TriggerCondition,
    recurring: bool,
}

struct CompletionCallback {
    id: u32,
    filter_type: TaskType,
    callback: Box<dyn Fn(&TaskResult) + Send + Sync>,
}

type SafeModeHook = Box<dyn Fn(&str) + Send + Sync>;

struct SchedulerShared {
    running: AtomicBool,
    tasks: Mutex<HashMap<String, SharedEntry>>,
    heap: Mutex<std::collections::BinaryHeap<QueuedTask>>,
    heap_cv: Condvar,
    conditional: Mutex<Vec<ConditionalEntry>>,
    tick: Mutex<()>,
    tick_cv: Condvar,
    results: Mutex<HashMap<String, TaskResult>>,
    callbacks: Mutex<Vec<CompletionCallback>>,
    events: Mutex<HashSet<String>>,
    position: Mutex<OrbitPosition>,
    safe_mode_hook: Mutex<Option<SafeModeHook>>,
    seq: AtomicU64,
    task_counter: AtomicU64,
    next_callback_id: AtomicU32,
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
    radiation_events: AtomicU64,
    default_context: TaskContext,
    tick_interval: Duration,
}

pub struct OrbitalTaskScheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OrbitalTaskScheduler {
    pub fn new() -> Self {
        Self::with_tick_interval(Duration::from_millis(CONDITION_TICK_MS))
    }

    pub fn with_tick_interval(tick_interval: Duration) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                running: AtomicBool::new(false),
                tasks: Mutex::new(HashMap::new()),
                heap: Mutex::new(std::collections::BinaryHeap::new()),
                heap_cv: Condvar::new(),
                conditional: Mutex::new(Vec::new()),
                tick: Mutex::new(()),
                tick_cv: Condvar::new(),
                results: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(Vec::new()),
                events: Mutex::new(HashSet::new()),
                position: Mutex::new(OrbitPosition::default()),
                safe_mode_hook: Mutex::new(None),
                seq: AtomicU64::new(0),
                task_counter: AtomicU64::new(0),
                next_callback_id: AtomicU32::new(1),
                tasks_executed: AtomicU64::new(0),
                tasks_failed: AtomicU64::new(0),
                radiation_events: AtomicU64::new(0),
                default_context: TaskContext::default(),
                tick_interval,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the execution and condition-evaluation workers.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return false;
        }
        info!("starting orbital task scheduler");

        let mut workers = self.workers.lock().expect("worker table poisoned");
        let execution = Arc::clone(&self.shared);
        workers.push(
            std::thread::Builder::new()
                .name("sched-exec".into())
                .spawn(move || execution_worker(&execution))
                .expect("failed to spawn execution worker"),
        );
        let condition = Arc::clone(&self.shared);
        workers.push(
            std::thread::Builder::new()
                .name("sched-cond".into())
                .spawn(move || condition_worker(&condition))
                .expect("failed to spawn condition worker"),
        );
        true
    }

    /// Stop both workers and join them. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping orbital task scheduler");
        self.shared.heap_cv.notify_all();
        self.shared.tick_cv.notify_all();
        let mut workers = self.workers.lock().expect("worker table poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("orbital task scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Schedule a one-shot task. Returns the task id.
    pub fn schedule(&self, task: Task) -> Result<String, SchedulerError> {
        self.admit(task, None, None)
    }

    /// Schedule a task deferred until the trigger condition is satisfied.
    pub fn schedule_conditional(
        &self,
        task: Task,
        trigger: TriggerCondition,
    ) -> Result<String, SchedulerError> {
        self.admit(task, Some(trigger), None)
    }

    /// Schedule a task relaunched at the given interval after each
    /// successful completion.
    pub fn schedule_recurring(
        &self,
        task: Task,
        interval: Duration,
    ) -> Result<String, SchedulerError> {
        self.admit(task, None, Some(interval))
    }

    fn admit(
        &self,
        mut task: Task,
        trigger: Option<TriggerCondition>,
        interval: Option<Duration>,
    ) -> Result<String, SchedulerError> {
        if !self.is_running() {
            error!(name = %task.name, "cannot schedule: scheduler not running");
            return Err(SchedulerError::NotRunning);
        }
        if task.id.is_empty() {
            task.id = self.generate_task_id();
        }
        let id = task.id.clone();
        let priority = task.priority;
        let scheduled_time = task.scheduled_time;

        let entry = Arc::new(Mutex::new(TaskEntry {
            task,
            status: TaskStatus::Pending,
            actual_start: None,
            actual_end: None,
            error_message: String::new(),
            retries_used: 0,
            output: BTreeMap::new(),
            recurring_interval: interval,
            radiation_event: false,
        }));

        {
            let mut tasks = self.shared.tasks.lock().expect("task map poisoned");
            tasks.insert(id.clone(), Arc::clone(&entry));
        }

        match trigger {
            Some(trigger) => {
                debug!(task = %id, "scheduling conditional task");
                let mut conditional = self
                    .shared
                    .conditional
                    .lock()
                    .expect("conditional list poisoned");
                conditional.push(ConditionalEntry {
                    entry,
                    trigger,
                    recurring: interval.is_some(),
                });
            }
            None => {
                info!(task = %id, "scheduling task");
                push_entry(&self.shared, entry, priority, scheduled_time);
            }
        }
        Ok(id)
    }

    /// Cancel a task that has not started running.
    pub fn cancel(&self, task_id: &str) -> Result<(), SchedulerError> {
        let entry = self.find(task_id)?;
        let mut entry = entry.lock().expect("task entry poisoned");
        if entry.status == TaskStatus::Running {
            warn!(task = task_id, "cannot cancel running task");
            return Err(SchedulerError::InvalidTransition);
        }
        entry.status = TaskStatus::Canceled;
        info!(task = task_id, "task canceled");
        Ok(())
    }

    /// Suspend a pending or running task. Applied mid-run it does not stop
    /// the current invocation but prevents re-queueing.
    pub fn suspend(&self, task_id: &str) -> Result<(), SchedulerError> {
        let entry = self.find(task_id)?;
        let mut entry = entry.lock().expect("task entry poisoned");
        if !matches!(entry.status, TaskStatus::Pending | TaskStatus::Running) {
            return Err(SchedulerError::InvalidTransition);
        }
        entry.status = TaskStatus::Suspended;
        info!(task = task_id, "task suspended");
        Ok(())
    }

    /// Return a suspended task to the pending queue.
    pub fn resume(&self, task_id: &str) -> Result<(), SchedulerError> {
        let entry = self.find(task_id)?;
        let (priority, scheduled_time) = {
            let mut guard = entry.lock().expect("task entry poisoned");
            if guard.status != TaskStatus::Suspended {
                return Err(SchedulerError::InvalidTransition);
            }
            guard.status = TaskStatus::Pending;
            (guard.task.priority, guard.task.scheduled_time)
        };
        info!(task = task_id, "task resumed");
        push_entry(&self.shared, entry, priority, scheduled_time);
        Ok(())
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let tasks = self.shared.tasks.lock().expect("task map poisoned");
        tasks
            .get(task_id)
            .map(|entry| entry.lock().expect("task entry poisoned").status)
    }

    /// Result of the most recent completed execution, if any.
    pub fn result(&self, task_id: &str) -> Option<TaskResult> {
        let results = self.shared.results.lock().expect("result map poisoned");
        results.get(task_id).cloned()
    }

    pub fn all_tasks(&self) -> Vec<TaskSnapshot> {
        let tasks = self.shared.tasks.lock().expect("task map poisoned");
        tasks.values().map(snapshot).collect()
    }

    pub fn by_status(&self, status: TaskStatus) -> Vec<TaskSnapshot> {
        self.all_tasks()
            .into_iter()
            .filter(|snap| snap.status == status)
            .collect()
    }

    /// Register a completion callback filtered by task type.
    pub fn register_completion_callback<F>(&self, callback: F, filter_type: TaskType) -> u32
    where
        F: Fn(&TaskResult) + Send + Sync + 'static,
    {
        let id = self.shared.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = self.shared.callbacks.lock().expect("callbacks poisoned");
        callbacks.push(CompletionCallback {
            id,
            filter_type,
            callback: Box::new(callback),
        });
        debug!(callback = id, ?filter_type, "registered completion callback");
        id
    }

    pub fn unregister_completion_callback(&self, callback_id: u32) {
        let mut callbacks = self.shared.callbacks.lock().expect("callbacks poisoned");
        callbacks.retain(|entry| entry.id != callback_id);
    }

    /// Feed a new orbit fix and wake the condition worker.
    pub fn update_orbit(&self, position: OrbitPosition) {
        {
            let mut current = self.shared.position.lock().expect("position poisoned");
            *current = position;
        }
        debug!(
            alt = position.altitude_km,
            lat = position.latitude_deg,
            lon = position.longitude_deg,
            "orbit position updated"
        );
        self.shared.tick_cv.notify_all();
    }

    pub fn current_orbit(&self) -> OrbitPosition {
        *self.shared.position.lock().expect("position poisoned")
    }

    /// Raise a named event; conditional tasks waiting on it fire at the next
    /// evaluation tick.
    pub fn signal_event(&self, name: &str) {
        {
            let mut events = self.shared.events.lock().expect("event set poisoned");
            events.insert(name.to_string());
        }
        debug!(event = name, "event signaled");
        self.shared.tick_cv.notify_all();
    }

    /// Apply a recovery strategy to a task currently in `Failed`.
    pub fn recover(&self, task_id: &str, strategy: RecoveryStrategy) -> Result<(), SchedulerError> {
        let entry = self.find(task_id)?;
        let requeue = {
            let mut guard = entry.lock().expect("task entry poisoned");
            if guard.status != TaskStatus::Failed {
                warn!(task = task_id, status = ?guard.status, "cannot recover task");
                return Err(SchedulerError::InvalidTransition);
            }
            info!(task = task_id, ?strategy, "recovering task");

            match strategy {
                RecoveryStrategy::Retry => {
                    guard.status = TaskStatus::Pending;
                    guard.retries_used = 0;
                    true
                }
                RecoveryStrategy::CheckpointRestore => {
                    guard.status = TaskStatus::Pending;
                    guard.retries_used = 0;
                    guard
                        .task
                        .metadata
                        .insert("recovery_type".into(), "checkpoint".into());
                    true
                }
                RecoveryStrategy::AlternateRoutine => {
                    guard.status = TaskStatus::Pending;
                    guard.retries_used = 0;
                    guard
                        .task
                        .metadata
                        .insert("recovery_type".into(), "alternate".into());
                    true
                }
                RecoveryStrategy::GroundAssistance => {
                    guard.status = TaskStatus::Suspended;
                    guard
                        .task
                        .metadata
                        .insert("recovery_type".into(), "ground_assist".into());
                    guard.task.metadata.insert(
                        "ground_assist_requested".into(),
                        format_timestamp(SystemTime::now()),
                    );
                    info!(task = task_id, "ground assistance requested");
                    false
                }
                RecoveryStrategy::SafeMode => {
                    guard.status = TaskStatus::Suspended;
                    guard
                        .task
                        .metadata
                        .insert("recovery_type".into(), "safe_mode".into());
                    warn!(task = task_id, "task triggered safe-mode recovery");
                    false
                }
            }
        };

        if requeue {
            let (priority, scheduled_time) = {
                let guard = entry.lock().expect("task entry poisoned");
                (guard.task.priority, guard.task.scheduled_time)
            };
            push_entry(&self.shared, entry, priority, scheduled_time);
        } else if strategy == RecoveryStrategy::SafeMode {
            let hook = self.shared.safe_mode_hook.lock().expect("hook poisoned");
            if let Some(hook) = hook.as_ref() {
                hook(task_id);
            }
        }
        Ok(())
    }

    /// Install the system-wide safe-mode entry hook invoked by the
    /// `SafeMode` recovery strategy.
    pub fn set_safe_mode_hook<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut slot = self.shared.safe_mode_hook.lock().expect("hook poisoned");
        *slot = Some(Box::new(hook));
    }

    /// Log and return the current execution metrics.
    pub fn report_metrics(&self) -> SchedulerMetrics {
        let mut census: BTreeMap<String, usize> = BTreeMap::new();
        {
            let tasks = self.shared.tasks.lock().expect("task map poisoned");
            for entry in tasks.values() {
                let status = entry.lock().expect("task entry poisoned").status;
                *census.entry(format!("{:?}", status)).or_insert(0) += 1;
            }
        }
        let metrics = SchedulerMetrics {
            tasks_executed: self.shared.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.shared.tasks_failed.load(Ordering::Relaxed),
            radiation_events: self.shared.radiation_events.load(Ordering::Relaxed),
            census,
        };
        info!(
            executed = metrics.tasks_executed,
            failed = metrics.tasks_failed,
            radiation_events = metrics.radiation_events,
            "task metrics report"
        );
        metrics
    }

    fn find(&self, task_id: &str) -> Result<SharedEntry, SchedulerError> {
        let tasks = self.shared.tasks.lock().expect("task map poisoned");
        tasks
            .get(task_id)
            .cloned()
            .ok_or(SchedulerError::TaskNotFound)
    }

    fn generate_task_id(&self) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let counter = self.shared.task_counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}{:08x}", now_ms, counter)
    }
}

impl Default for OrbitalTaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OrbitalTaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn snapshot(entry: &SharedEntry) -> TaskSnapshot {
    let guard = entry.lock().expect("task entry poisoned");
    TaskSnapshot {
        id: guard.task.id.clone(),
        name: guard.task.name.clone(),
        task_type: guard.task.task_type,
        priority: guard.task.priority,
        status: guard.status,
        metadata: guard.task.metadata.clone(),
    }
}

fn push_entry(
    shared: &SchedulerShared,
    entry: SharedEntry,
    priority: TaskPriority,
    scheduled_time: SystemTime,
) {
    {
        let mut heap = shared.heap.lock().expect("heap poisoned");
        heap.push(QueuedTask {
            priority,
            scheduled_time,
            seq: shared.seq.fetch_add(1, Ordering::Relaxed),
            entry,
        });
    }
    shared.heap_cv.notify_one();
}

fn format_timestamp(time: SystemTime) -> String {
    let ms = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{}", ms)
}

// ---- execution worker ----

fn execution_worker(shared: &Arc<SchedulerShared>) {
    info!("task execution thread started");

    while shared.running.load(Ordering::SeqCst) {
        let queued = {
            let mut heap = shared.heap.lock().expect("heap poisoned");
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                if heap.peek().is_some() {
                    break heap.pop();
                }
                let (guard, _) = shared
                    .heap_cv
                    .wait_timeout(heap, Duration::from_millis(DISPATCH_PARK_MS))
                    .expect("heap poisoned");
                heap = guard;
            }
        };

        let Some(queued) = queued else { continue };

        // Head of the heap still in the future: push back and park briefly.
        let now = SystemTime::now();
        if queued.scheduled_time > now {
            let delay = queued
                .scheduled_time
                .duration_since(now)
                .unwrap_or_default()
                .min(Duration::from_millis(DISPATCH_PARK_MS));
            {
                let mut heap = shared.heap.lock().expect("heap poisoned");
                heap.push(queued);
            }
            std::thread::sleep(delay);
            continue;
        }

        let entry = queued.entry;

        // Atomically transition PENDING -> RUNNING; anything else found in
        // the queue (canceled, suspended, stale retry) is skipped.
        {
            let mut guard = entry.lock().expect("task entry poisoned");
            if guard.status != TaskStatus::Pending {
                continue;
            }
            guard.status = TaskStatus::Running;
            guard.actual_start = Some(now);
        }

        execute_entry(shared, &entry);
    }

    info!("task execution thread stopped");
}

enum Disposition {
    Terminal(TaskStatus, String),
    Retry(u32),
}

/// Run one queued entry to a terminal state (or back to pending for retry).
fn execute_entry(shared: &Arc<SchedulerShared>, entry: &SharedEntry) {
    let (task_id, name, payload, context, radiation_protected, timeout, retry_limit) = {
        let guard = entry.lock().expect("task entry poisoned");
        (
            guard.task.id.clone(),
            guard.task.name.clone(),
            Arc::clone(&guard.task.payload),
            guard.task.build_context(&shared.default_context),
            guard.task.radiation_protected,
            guard.task.timeout,
            guard.task.retry_limit,
        )
    };

    info!(task = %task_id, name = %name, "executing task");
    let start = SystemTime::now();

    let mut radiation_event = false;
    let outcome: Result<bool, String> = if radiation_protected {
        Ok(execute_with_tmr(&payload, &context, &mut radiation_event))
    } else {
        run_payload(&payload, &context)
    };

    let end = SystemTime::now();
    let elapsed = end.duration_since(start).unwrap_or_default();

    let disposition = match outcome {
        Err(panic_message) => Disposition::Terminal(TaskStatus::Failed, panic_message),
        Ok(_) if elapsed > timeout => Disposition::Terminal(
            TaskStatus::Failed,
            format!(
                "task timed out (took {} ms, limit: {} ms)",
                elapsed.as_millis(),
                timeout.as_millis()
            ),
        ),
        Ok(true) => Disposition::Terminal(TaskStatus::Completed, String::new()),
        Ok(false) => {
            let retries_used = entry.lock().expect("task entry poisoned").retries_used;
            if retries_used < retry_limit {
                Disposition::Retry(retries_used + 1)
            } else {
                Disposition::Terminal(
                    TaskStatus::Failed,
                    format!("task failed after {} retries", retries_used),
                )
            }
        }
    };

    match disposition {
        Disposition::Retry(next_retry) => {
            let requeue = {
                let mut guard = entry.lock().expect("task entry poisoned");
                guard.retries_used = next_retry;
                guard.radiation_event |= radiation_event;
                if guard.status == TaskStatus::Suspended {
                    // Suspended mid-run: the retry is not re-queued.
                    None
                } else {
                    guard.status = TaskStatus::Pending;
                    Some((guard.task.priority, guard.task.scheduled_time))
                }
            };
            if radiation_event {
                shared.radiation_events.fetch_add(1, Ordering::Relaxed);
            }
            if let Some((priority, scheduled_time)) = requeue {
                info!(
                    task = %task_id,
                    attempt = next_retry,
                    limit = retry_limit,
                    "retrying task"
                );
                push_entry(shared, Arc::clone(entry), priority, scheduled_time);
            }
        }
        Disposition::Terminal(status, error_message) => {
            let (result, relaunch, suspended_mid_run) = {
                let mut guard = entry.lock().expect("task entry poisoned");
                let suspended_mid_run = guard.status == TaskStatus::Suspended;
                if !suspended_mid_run {
                    guard.status = status;
                }
                guard.actual_end = Some(end);
                guard.error_message = error_message.clone();
                guard.radiation_event |= radiation_event;

                let result = TaskResult {
                    task_id: task_id.clone(),
                    status,
                    start_time: start,
                    end_time: end,
                    error_message,
                    output: guard.output.clone(),
                    retry_attempts: guard.retries_used,
                    radiation_event_detected: guard.radiation_event,
                };

                let relaunch = !suspended_mid_run
                    && status == TaskStatus::Completed
                    && guard.recurring_interval.is_some();
                (result, relaunch, suspended_mid_run)
            };

            {
                let mut results = shared.results.lock().expect("result map poisoned");
                results.insert(task_id.clone(), result.clone());
            }

            // An invocation that was suspended mid-run is not this task's
            // terminal disposition: the entry stays SUSPENDED and will run
            // to a real terminal state after resume. Counting or notifying
            // here would double both when that happens.
            if suspended_mid_run {
                debug!(
                    task = %task_id,
                    "invocation finished after mid-run suspension; result recorded without emission"
                );
            } else {
                shared.tasks_executed.fetch_add(1, Ordering::Relaxed);
                if status == TaskStatus::Failed {
                    shared.tasks_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(task = %task_id, error = %result.error_message, "task failed");
                }
                if result.radiation_event_detected {
                    shared.radiation_events.fetch_add(1, Ordering::Relaxed);
                }

                notify_completion(shared, &result);
            }

            if relaunch {
                let relaunch_key = {
                    let mut guard = entry.lock().expect("task entry poisoned");
                    match guard.recurring_interval {
                        Some(interval) => {
                            let next_time = SystemTime::now() + interval;
                            guard.status = TaskStatus::Pending;
                            guard.task.scheduled_time = next_time;
                            guard.retries_used = 0;
                            guard.radiation_event = false;
                            Some((guard.task.priority, next_time))
                        }
                        None => None,
                    }
                };
                if let Some((priority, next_time)) = relaunch_key {
                    push_entry(shared, Arc::clone(entry), priority, next_time);
                }
            }
        }
    }
}

fn run_payload(payload: &crate::task::TaskPayload, context: &TaskContext) -> Result<bool, String> {
    catch_unwind(AssertUnwindSafe(|| payload(context))).map_err(|cause| panic_text(cause.as_ref()))
}

fn panic_text(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = cause.downcast_ref::<&str>() {
        format!("Exception: {}", text)
    } else if let Some(text) = cause.downcast_ref::<String>() {
        format!("Exception: {}", text)
    } else {
        "Unknown exception".to_string()
    }
}

/// Execute the payload three times serially and majority-vote the results.
/// A panicking invocation contributes `false` and flags a radiation event.
fn execute_with_tmr(
    payload: &crate::task::TaskPayload,
    context: &TaskContext,
    radiation_event: &mut bool,
) -> bool {
    debug!("executing task with triple modular redundancy");

    let mut votes = [false; 3];
    let mut panics = 0;
    for (index, vote) in votes.iter_mut().enumerate() {
        match run_payload(payload, context) {
            Ok(result) => *vote = result,
            Err(message) => {
                warn!(invocation = index + 1, error = %message, "TMR invocation failed");
                *radiation_event = true;
                panics += 1;
            }
        }
    }

    if panics == 3 {
        error!("TMR critical radiation event: all three invocations failed");
        return false;
    }

    let agreeing_true = votes.iter().filter(|v| **v).count();
    if agreeing_true == 1 || agreeing_true == 2 {
        warn!("TMR detected potential SEU (vote: 2-1)");
        *radiation_event = true;
    }

    agreeing_true >= 2
}

fn notify_completion(shared: &SchedulerShared, result: &TaskResult) {
    let task_type = {
        let tasks = shared.tasks.lock().expect("task map poisoned");
        tasks
            .get(&result.task_id)
            .map(|entry| entry.lock().expect("task entry poisoned").task.task_type)
    };
    let Some(task_type) = task_type else { return };

    let callbacks = shared.callbacks.lock().expect("callbacks poisoned");
    for entry in callbacks.iter() {
        if entry.filter_type != task_type {
            continue;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| (entry.callback)(result)));
        if outcome.is_err() {
            error!(callback = entry.id, task = %result.task_id, "completion callback panicked");
        }
    }
}

// ---- condition worker ----

fn condition_worker(shared: &Arc<SchedulerShared>) {
    info!("condition evaluation thread started");

    while shared.running.load(Ordering::SeqCst) {
        {
            let guard = shared.tick.lock().expect("tick lock poisoned");
            let _ = shared
                .tick_cv
                .wait_timeout(guard, shared.tick_interval)
                .expect("tick lock poisoned");
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        evaluate_conditions(shared);
    }

    info!("condition evaluation thread stopped");
}

/// One evaluation pass over the conditional list. Each scheduler lock is
/// taken and released in turn; no two are ever held together.
fn evaluate_conditions(shared: &Arc<SchedulerShared>) {
    let now = SystemTime::now();
    let position = *shared.position.lock().expect("position poisoned");
    let events: HashSet<String> = shared
        .events
        .lock()
        .expect("event set poisoned")
        .iter()
        .cloned()
        .collect();

    // Completed-task snapshot for dependency triggers.
    let completed: HashSet<String> = {
        let tasks = shared.tasks.lock().expect("task map poisoned");
        tasks
            .iter()
            .filter(|(_, entry)| {
                entry.lock().expect("task entry poisoned").status == TaskStatus::Completed
            })
            .map(|(id, _)| id.clone())
            .collect()
    };

    let mut triggered: Vec<(SharedEntry, TaskPriority)> = Vec::new();
    {
        let mut conditional = shared
            .conditional
            .lock()
            .expect("conditional list poisoned");
        conditional.retain(|candidate| {
            let status = candidate.entry.lock().expect("task entry poisoned").status;
            if status == TaskStatus::Canceled {
                return false;
            }
            if status != TaskStatus::Pending {
                return true;
            }

            if !trigger_satisfied(&candidate.trigger, now, &position, &events, &completed) {
                return true;
            }

            let priority = {
                let mut guard = candidate.entry.lock().expect("task entry poisoned");
                guard.task.scheduled_time = now;
                guard.task.priority
            };
            triggered.push((Arc::clone(&candidate.entry), priority));
            // Non-recurring conditional tasks leave the list once fired.
            candidate.recurring
        });
    }

    if triggered.is_empty() {
        return;
    }
    debug!(count = triggered.len(), "conditional tasks triggered");

    // Every trigger observed this tick enqueues before the executor can pop.
    {
        let mut heap = shared.heap.lock().expect("heap poisoned");
        for (entry, priority) in triggered.drain(..) {
            heap.push(QueuedTask {
                priority,
                scheduled_time: now,
                seq: shared.seq.fetch_add(1, Ordering::Relaxed),
                entry,
            });
        }
    }
    shared.heap_cv.notify_one();
}

fn trigger_satisfied(
    trigger: &TriggerCondition,
    now: SystemTime,
    position: &OrbitPosition,
    events: &HashSet<String>,
    completed: &HashSet<String>,
) -> bool {
    if let Some(time_point) = trigger.time_point {
        if now >= time_point {
            return true;
        }
    }
    if let Some(target) = &trigger.orbit_position {
        if position.matches(target) {
            return true;
        }
    }
    if let Some(event_name) = &trigger.event_name {
        if events.contains(event_name) {
            return true;
        }
    }
    if let Some(dependency) = &trigger.dependency_task_id {
        if completed.contains(dependency) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for_terminal(scheduler: &OrbitalTaskScheduler, id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = scheduler.status(id) {
                if status.is_terminal() {
                    return true;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn schedule_requires_running_scheduler() {
        let scheduler = OrbitalTaskScheduler::new();
        let task = Task::new("idle", TaskType::Maintenance, |_| true);
        assert!(matches!(
            scheduler.schedule(task),
            Err(SchedulerError::NotRunning)
        ));
    }

    #[test]
    fn simple_task_completes() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let id = scheduler
            .schedule(Task::new("noop", TaskType::Maintenance, |_| true))
            .unwrap();
        assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Completed));
        let result = scheduler.result(&id).unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        scheduler.stop();
    }

    #[test]
    fn failing_task_retries_up_to_limit() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let attempts = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&attempts);
        let task = Task::new("flaky", TaskType::Maintenance, move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
            false
        })
        .with_retry_limit(2);
        let id = scheduler.schedule(task).unwrap();
        assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Failed));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let result = scheduler.result(&id).unwrap();
        assert!(result.error_message.contains("after 2 retries"));
        scheduler.stop();
    }

    #[test]
    fn panicking_task_fails_with_exception_message() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let task = Task::new("boom", TaskType::Maintenance, |_| {
            panic!("attitude solution diverged");
        });
        let id = scheduler.schedule(task).unwrap();
        assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
        let result = scheduler.result(&id).unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message.contains("attitude solution diverged"));
        scheduler.stop();
    }

    #[test]
    fn timeout_overrides_successful_outcome() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let task = Task::new("slow", TaskType::Maintenance, |_| {
            std::thread::sleep(Duration::from_millis(80));
            true
        })
        .with_timeout(Duration::from_millis(10));
        let id = scheduler.schedule(task).unwrap();
        assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
        let result = scheduler.result(&id).unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message.contains("timed out"));
        scheduler.stop();
    }

    #[test]
    fn cancel_pending_future_task() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let task = Task::new("later", TaskType::Maintenance, |_| true)
            .with_scheduled_time(SystemTime::now() + Duration::from_secs(60));
        let id = scheduler.schedule(task).unwrap();
        scheduler.cancel(&id).unwrap();
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Canceled));
        scheduler.stop();
    }

    #[test]
    fn suspend_resume_round_trip() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let task = Task::new("held", TaskType::Maintenance, |_| true)
            .with_scheduled_time(SystemTime::now() + Duration::from_secs(60));
        let id = scheduler.schedule(task).unwrap();
        scheduler.suspend(&id).unwrap();
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Suspended));
        scheduler.resume(&id).unwrap();
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Pending));
        scheduler.stop();
    }

    #[test]
    fn recovery_annotates_metadata() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let task = Task::new("doomed", TaskType::Maintenance, |_| false).with_retry_limit(0);
        let id = scheduler.schedule(task).unwrap();
        assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Failed));

        // Suspend-style strategies annotate without re-queueing.
        scheduler
            .recover(&id, RecoveryStrategy::GroundAssistance)
            .unwrap();
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Suspended));
        let snap = scheduler
            .all_tasks()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap();
        assert_eq!(
            snap.metadata.get("recovery_type").map(String::as_str),
            Some("ground_assist")
        );
        assert!(snap.metadata.contains_key("ground_assist_requested"));
        scheduler.stop();
    }

    #[test]
    fn safe_mode_recovery_fires_hook() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let tripped = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&tripped);
        scheduler.set_safe_mode_hook(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let task = Task::new("fatal", TaskType::Maintenance, |_| false).with_retry_limit(0);
        let id = scheduler.schedule(task).unwrap();
        assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
        scheduler.recover(&id, RecoveryStrategy::SafeMode).unwrap();
        assert_eq!(tripped.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Suspended));
        scheduler.stop();
    }

    #[test]
    fn dependency_trigger_fires_after_completion() {
        let scheduler = OrbitalTaskScheduler::with_tick_interval(Duration::from_millis(50));
        scheduler.start();

        let first = scheduler
            .schedule(Task::new("first", TaskType::Maintenance, |_| true).with_id("dep-parent"))
            .unwrap();
        let second = scheduler
            .schedule_conditional(
                Task::new("second", TaskType::Maintenance, |_| true),
                TriggerCondition::after_task(first.clone()),
            )
            .unwrap();

        assert!(wait_for_terminal(&scheduler, &first, Duration::from_secs(5)));
        assert!(wait_for_terminal(&scheduler, &second, Duration::from_secs(5)));
        assert_eq!(scheduler.status(&second), Some(TaskStatus::Completed));
        scheduler.stop();
    }

    #[test]
    fn event_trigger_fires_after_signal() {
        let scheduler = OrbitalTaskScheduler::with_tick_interval(Duration::from_millis(50));
        scheduler.start();
        let id = scheduler
            .schedule_conditional(
                Task::new("eclipse-entry", TaskType::PowerManagement, |_| true),
                TriggerCondition::on_event("eclipse"),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Pending));

        scheduler.signal_event("eclipse");
        assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
        assert_eq!(scheduler.status(&id), Some(TaskStatus::Completed));
        scheduler.stop();
    }

    #[test]
    fn metrics_census_counts_terminal_states() {
        let scheduler = OrbitalTaskScheduler::new();
        scheduler.start();
        let ok = scheduler
            .schedule(Task::new("ok", TaskType::Maintenance, |_| true))
            .unwrap();
        let bad = scheduler
            .schedule(Task::new("bad", TaskType::Maintenance, |_| false).with_retry_limit(0))
            .unwrap();
        assert!(wait_for_terminal(&scheduler, &ok, Duration::from_secs(5)));
        assert!(wait_for_terminal(&scheduler, &bad, Duration::from_secs(5)));

        let metrics = scheduler.report_metrics();
        assert_eq!(metrics.tasks_executed, 2);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.census_count(TaskStatus::Completed), 1);
        assert_eq!(metrics.census_count(TaskStatus::Failed), 1);
        scheduler.stop();
    }
}
