//! The single-threaded event-loop executor.

use std::any::Any;
use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use core_affinity::CoreId;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use strand_common::Completion;

use crate::error::ExecutorError;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const TERMINATED: u8 = 3;

/// Lifecycle state of an [`EventExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Built but no worker thread started yet.
    Created,
    /// Worker thread running.
    Running,
    /// Draining remaining work; no new scheduled work accepted.
    ShuttingDown,
    /// Terminal. All submissions are rejected.
    Terminated,
}

/// How long an idle worker sleeps before re-checking its state, so shutdown
/// is observed promptly even without wakeups.
const WAKE_INTERVAL: Duration = Duration::from_secs(1);

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Installed by the worker thread itself; read by `in_event_loop` and
    // the group's affinity fast path.
    static CURRENT_EXECUTOR: Cell<Option<u64>> = const { Cell::new(None) };
}

pub(crate) fn current_executor_id() -> Option<u64> {
    CURRENT_EXECUTOR.with(Cell::get)
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct TaskCell {
    run: Task,
    completion: Option<Completion>,
}

const PHASE_PENDING: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_CANCELLED: u8 = 2;

struct ScheduledState {
    phase: AtomicU8,
    completion: Completion,
}

struct ScheduledEntry {
    deadline: Instant,
    seq: u64,
    run: Task,
    state: Arc<ScheduledState>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the max-heap pops the earliest deadline; ties go to
        // the lower submission sequence.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Clone, Copy)]
struct ShutdownPlan {
    started: Instant,
    quiet_period: Duration,
    timeout: Duration,
}

struct Work {
    ready: VecDeque<TaskCell>,
    timers: BinaryHeap<ScheduledEntry>,
    /// Last arrival or task completion; the quiet period measures from here.
    last_activity: Instant,
    shutdown: Option<ShutdownPlan>,
}

struct Inner {
    id: u64,
    name: String,
    core_id: Option<CoreId>,
    state: AtomicU8,
    work: Mutex<Work>,
    wake: Condvar,
    seq: AtomicU64,
    termination: Completion,
}

/// A handle to one task scheduled for a deadline.
///
/// Cancellation is idempotent. Cancelling before the task started
/// guarantees its body never runs and resolves the completion as cancelled;
/// cancelling afterwards has no effect.
pub struct ScheduledHandle {
    deadline: Instant,
    state: Arc<ScheduledState>,
}

impl ScheduledHandle {
    /// The absolute deadline, fixed at schedule time.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Attempts to cancel the task. Returns whether the task is cancelled
    /// (by this or an earlier call).
    pub fn cancel(&self) -> bool {
        if self
            .state
            .phase
            .compare_exchange(
                PHASE_PENDING,
                PHASE_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.state.completion.cancel();
        }
        self.state.phase.load(Ordering::Acquire) == PHASE_CANCELLED
    }

    /// The task's completion handle.
    pub fn completion(&self) -> Completion {
        self.state.completion.clone()
    }
}

/// A single-threaded, cooperatively scheduled event loop.
///
/// Cloning yields another handle to the same loop. The worker thread starts
/// lazily on first submission and runs until
/// [`shutdown_gracefully`](EventExecutor::shutdown_gracefully) completes.
#[derive(Clone)]
pub struct EventExecutor {
    inner: Arc<Inner>,
}

impl EventExecutor {
    /// Starts building an executor.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The executor's name, used for its worker thread and log context.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        match self.inner.state.load(Ordering::Acquire) {
            CREATED => ExecutorState::Created,
            RUNNING => ExecutorState::Running,
            SHUTTING_DOWN => ExecutorState::ShuttingDown,
            _ => ExecutorState::Terminated,
        }
    }

    /// Whether graceful shutdown has begun (or finished).
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= SHUTTING_DOWN
    }

    /// Whether the executor reached its terminal state.
    pub fn is_terminated(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TERMINATED
    }

    /// Whether the calling thread is this executor's worker thread.
    pub fn in_event_loop(&self) -> bool {
        current_executor_id() == Some(self.inner.id)
    }

    /// Enqueues `task` for execution on the loop.
    ///
    /// Lazily starts the worker. Callable from the worker itself, in which
    /// case the task runs after the current one, preserving single-flight
    /// execution. Fails once the executor terminated.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), ExecutorError> {
        self.enqueue(TaskCell {
            run: Box::new(task),
            completion: None,
        })
    }

    /// Like [`execute`](EventExecutor::execute), returning a completion
    /// resolved when the task ran (or failed).
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<Completion, ExecutorError> {
        let completion = Completion::new();
        self.enqueue(TaskCell {
            run: Box::new(task),
            completion: Some(completion.clone()),
        })?;
        Ok(completion)
    }

    fn enqueue(&self, cell: TaskCell) -> Result<(), ExecutorError> {
        if self.inner.state.load(Ordering::Acquire) == CREATED {
            self.ensure_started();
        }
        let mut work = self.inner.work.lock();
        // Termination flips under this lock, so the check cannot race with
        // the final drain.
        if self.inner.state.load(Ordering::Acquire) == TERMINATED {
            return Err(ExecutorError::Rejected {
                executor: self.inner.name.clone(),
                state: "terminated",
            });
        }
        work.ready.push_back(cell);
        work.last_activity = Instant::now();
        drop(work);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Schedules `task` to run after `delay`.
    ///
    /// The delay is converted to an absolute deadline exactly once, here.
    /// Scheduled tasks run in non-decreasing deadline order, ties by
    /// submission sequence. Rejected as soon as shutdown begins.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<ScheduledHandle, ExecutorError> {
        match self.inner.state.load(Ordering::Acquire) {
            CREATED => self.ensure_started(),
            RUNNING => {}
            SHUTTING_DOWN => {
                return Err(ExecutorError::Rejected {
                    executor: self.inner.name.clone(),
                    state: "shutting down",
                });
            }
            _ => {
                return Err(ExecutorError::Rejected {
                    executor: self.inner.name.clone(),
                    state: "terminated",
                });
            }
        }
        let deadline = Instant::now() + delay;
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ScheduledState {
            phase: AtomicU8::new(PHASE_PENDING),
            completion: Completion::new(),
        });
        let entry = ScheduledEntry {
            deadline,
            seq,
            run: Box::new(task),
            state: Arc::clone(&state),
        };
        {
            let mut work = self.inner.work.lock();
            if self.inner.state.load(Ordering::Acquire) == TERMINATED {
                return Err(ExecutorError::Rejected {
                    executor: self.inner.name.clone(),
                    state: "terminated",
                });
            }
            work.timers.push(entry);
        }
        self.inner.wake.notify_one();
        Ok(ScheduledHandle { deadline, state })
    }

    /// Initiates graceful shutdown and returns the termination completion.
    ///
    /// No new scheduled work is accepted from this point. Remaining work is
    /// drained until the loop has been quiet for `quiet_period` (new
    /// arrivals reset it), capped by `timeout`; then the executor
    /// terminates and signals all waiters. Repeated calls return the same
    /// completion.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Completion {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                CREATED => {
                    // Never started: nothing to drain.
                    if self
                        .inner
                        .state
                        .compare_exchange(CREATED, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.inner.termination.succeed();
                        return self.inner.termination.clone();
                    }
                }
                RUNNING => {
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            RUNNING,
                            SHUTTING_DOWN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let mut work = self.inner.work.lock();
                        work.shutdown = Some(ShutdownPlan {
                            started: Instant::now(),
                            quiet_period,
                            timeout,
                        });
                        drop(work);
                        self.inner.wake.notify_one();
                        debug!(
                            "event loop \"{}\" shutting down (quiet {:?}, timeout {:?})",
                            self.inner.name, quiet_period, timeout
                        );
                        return self.inner.termination.clone();
                    }
                }
                _ => return self.inner.termination.clone(),
            }
        }
    }

    /// Blocks until the executor terminated or `timeout` elapsed; returns
    /// whether termination was observed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.termination.wait_timeout(timeout).is_some()
    }

    fn ensure_started(&self) {
        if self
            .inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            thread::Builder::new()
                .name(inner.name.clone())
                .spawn(move || worker(inner))
                .expect("failed to spawn event loop worker");
        }
    }
}

impl std::fmt::Debug for EventExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventExecutor")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Configures and builds an [`EventExecutor`].
#[derive(Debug, Default)]
pub struct ExecutorBuilder {
    name: Option<String>,
    core_id: Option<CoreId>,
}

impl ExecutorBuilder {
    /// Creates a builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the worker thread-to-be.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(String::from(name));
        self
    }

    /// Pins the worker thread to the given CPU core.
    pub fn core_id(mut self, core_id: CoreId) -> Self {
        self.core_id = Some(core_id);
        self
    }

    /// Builds the executor. The worker thread starts lazily on first use.
    pub fn build(self) -> EventExecutor {
        let id = NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
        let name = self.name.unwrap_or_else(|| format!("strand-loop-{id}"));
        EventExecutor {
            inner: Arc::new(Inner {
                id,
                name,
                core_id: self.core_id,
                state: AtomicU8::new(CREATED),
                work: Mutex::new(Work {
                    ready: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    last_activity: Instant::now(),
                    shutdown: None,
                }),
                wake: Condvar::new(),
                seq: AtomicU64::new(0),
                termination: Completion::new(),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("task panicked")
    }
}

fn run_task(inner: &Inner, cell: TaskCell) {
    match catch_unwind(AssertUnwindSafe(cell.run)) {
        Ok(()) => {
            if let Some(completion) = cell.completion {
                completion.succeed();
            }
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!("task on event loop \"{}\" failed: {}", inner.name, reason);
            if let Some(completion) = cell.completion {
                completion.fail(reason);
            }
        }
    }
}

fn run_scheduled(inner: &Inner, entry: ScheduledEntry) {
    // Claim the entry; a concurrent cancel that wins this race means the
    // body never runs.
    if entry
        .state
        .phase
        .compare_exchange(
            PHASE_PENDING,
            PHASE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        trace!("skipping cancelled task on event loop \"{}\"", inner.name);
        return;
    }
    run_task(
        inner,
        TaskCell {
            run: entry.run,
            completion: Some(entry.state.completion.clone()),
        },
    );
}

fn terminate(inner: &Inner, mut work: MutexGuard<'_, Work>) {
    inner.state.store(TERMINATED, Ordering::Release);
    let abandoned = work.ready.len();
    for cell in work.ready.drain(..) {
        if let Some(completion) = cell.completion {
            completion.fail("executor terminated");
        }
    }
    for entry in work.timers.drain() {
        entry.state.completion.cancel();
    }
    drop(work);
    if abandoned > 0 {
        debug!(
            "event loop \"{}\" terminated abandoning {} task(s)",
            inner.name, abandoned
        );
    }
    inner.wake.notify_all();
    inner.termination.succeed();
}

fn worker(inner: Arc<Inner>) {
    CURRENT_EXECUTOR.with(|current| current.set(Some(inner.id)));
    if let Some(core_id) = inner.core_id {
        core_affinity::set_for_current(core_id);
    }
    trace!("event loop \"{}\" started", inner.name);

    loop {
        let mut ran = false;

        // All ready immediate tasks first.
        loop {
            let task = inner.work.lock().ready.pop_front();
            match task {
                Some(cell) => {
                    run_task(&inner, cell);
                    ran = true;
                }
                None => break,
            }
        }

        // Then every scheduled task whose deadline has passed, in order.
        let now = Instant::now();
        loop {
            let due = {
                let mut work = inner.work.lock();
                if work.timers.peek().is_some_and(|e| e.deadline <= now) {
                    work.timers.pop()
                } else {
                    None
                }
            };
            match due {
                Some(entry) => {
                    run_scheduled(&inner, entry);
                    ran = true;
                }
                None => break,
            }
        }

        if ran {
            inner.work.lock().last_activity = Instant::now();
            continue;
        }

        // Idle: wait for work, a deadline, or shutdown progress.
        let mut work = inner.work.lock();
        if !work.ready.is_empty() {
            continue;
        }
        if let Some(plan) = work.shutdown {
            let now = Instant::now();
            let quiet_for = now.saturating_duration_since(work.last_activity);
            let running_for = now.saturating_duration_since(plan.started);
            if quiet_for >= plan.quiet_period || running_for >= plan.timeout {
                terminate(&inner, work);
                return;
            }
            let wait_until =
                (work.last_activity + plan.quiet_period).min(plan.started + plan.timeout);
            inner.wake.wait_until(&mut work, wait_until);
            continue;
        }
        let bound = Instant::now() + WAKE_INTERVAL;
        let wait_until = work
            .timers
            .peek()
            .map_or(bound, |entry| entry.deadline.min(bound));
        inner.wake.wait_until(&mut work, wait_until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_submitted_task() {
        let executor = EventExecutor::builder().name("test-exec").build();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let completion = executor
            .submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(completion.wait().is_success());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .wait();
    }

    #[test]
    fn tasks_from_one_thread_run_in_submission_order() {
        let executor = EventExecutor::builder().build();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            executor
                .execute(move || {
                    order.lock().push(i);
                })
                .unwrap();
        }
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .wait();
        let observed = order.lock().clone();
        assert_eq!(observed, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_fails_its_completion_and_loop_survives() {
        let executor = EventExecutor::builder().build();
        let boom = executor.submit(|| panic!("boom")).unwrap();
        assert_eq!(
            boom.wait(),
            strand_common::Outcome::Failed(String::from("boom"))
        );
        // The loop keeps running other tasks.
        let after = executor.submit(|| {}).unwrap();
        assert!(after.wait().is_success());
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .wait();
    }

    #[test]
    fn in_event_loop_is_true_only_on_the_worker() {
        let executor = EventExecutor::builder().build();
        assert!(!executor.in_event_loop());
        let probe = executor.clone();
        let observed = Arc::new(AtomicUsize::new(0));
        let inside = observed.clone();
        executor
            .submit(move || {
                if probe.in_event_loop() {
                    inside.store(1, Ordering::SeqCst);
                }
            })
            .unwrap()
            .wait();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .wait();
    }

    #[test]
    fn cancel_before_execution_prevents_the_body() {
        let executor = EventExecutor::builder().build();
        // Force-start the worker so the timer machinery is live.
        executor.execute(|| {}).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let handle = executor
            .schedule(Duration::from_millis(200), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(handle.cancel());
        assert!(handle.cancel(), "cancellation is idempotent");
        assert!(handle.completion().wait_timeout(Duration::from_secs(1)).is_some());
        assert!(handle.completion().is_cancelled());
        thread::sleep(Duration::from_millis(300));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .wait();
    }

    #[test]
    fn schedule_rejected_once_shutdown_began() {
        let executor = EventExecutor::builder().build();
        executor.execute(|| {}).unwrap();
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .wait();
        assert!(matches!(
            executor.schedule(Duration::ZERO, || {}),
            Err(ExecutorError::Rejected { .. })
        ));
        assert!(matches!(
            executor.execute(|| {}),
            Err(ExecutorError::Rejected { .. })
        ));
    }
}
