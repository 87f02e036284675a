//! Worker pool with per-worker work lines.
//!
//! Each worker thread owns one work line, a LIFO intrusive list of tasks
//! guarded by its own mutex. Enqueueing prefers non-blocking pushes, round
//! robin across lines; dispatching scans twice around the lines so a lost
//! `try_lock` race on the first pass is tolerated. Workers with nothing to
//! do park on a one-shot wakeup token, and every dispatch iteration honors
//! pending thread-inversion requests.

use std::mem;
use std::num::NonZeroUsize;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::{env, thread};

use crate::inversion::{inversion_checkpoint, ThreadSnapshot};
use crate::profiling;
use crate::sleep::{SleepHelper, WakeupToken};

/// Signature of a task body. Must not unwind; a panic crossing this boundary
/// aborts the process.
pub type TaskFunction = unsafe extern "C" fn(task: *mut Task, worker_index: usize);

/// An intrusively linked unit of work.
///
/// While queued, `prev_link` points at the previous node's `next` field (or
/// at the list head for the first node) so removal is O(1) without a dummy
/// head, and `worker_data` points at the owning work line. Both are null
/// while detached.
///
/// Embed this as the first field of a `#[repr(C)]` struct to carry payload;
/// the task pointer passed to the function downcasts to the outer type.
#[repr(C)]
#[derive(Debug)]
pub struct Task {
    pub(crate) function: TaskFunction,
    pub(crate) next: *mut Task,
    pub(crate) prev_link: *mut *mut Task,
    pub(crate) worker_data: AtomicPtr<WorkLine>,
}

impl Task {
    pub fn new(function: TaskFunction) -> Self {
        Task {
            function,
            next: ptr::null_mut(),
            prev_link: ptr::null_mut(),
            worker_data: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Head of a work line's intrusive list. Lives inside the line's mutex so
/// `prev_link` back-pointers into it are only ever followed under the lock.
#[derive(Debug)]
struct LineHead(*mut Task);

unsafe impl Send for LineHead {}

/// One worker's task list: a mutex and a LIFO head.
#[derive(Debug)]
pub(crate) struct WorkLine {
    tasks: Mutex<LineHead>,
}

impl WorkLine {
    fn new() -> Self {
        WorkLine {
            tasks: Mutex::new(LineHead(ptr::null_mut())),
        }
    }

    /// Pushes without blocking; fails if the lock is contended.
    fn try_push(&self, task: *mut Task) -> bool {
        let Ok(mut head) = self.tasks.try_lock() else {
            return false;
        };
        unsafe { self.push_unprotected(&mut head, task) };
        true
    }

    fn push(&self, task: *mut Task) {
        let mut head = self.tasks.lock().unwrap();
        unsafe { self.push_unprotected(&mut head, task) };
    }

    /// Pops the most recently pushed task; fails on contention or empty.
    fn try_pop(&self) -> Option<*mut Task> {
        let Ok(mut head) = self.tasks.try_lock() else {
            return None;
        };
        unsafe { self.pop_unprotected(&mut head) }
    }

    /// Unlinks a specific task in O(1) through its back-pointer. Fails if
    /// the task is no longer on this line (someone popped it first).
    fn extract(&self, task: *mut Task) -> bool {
        let mut head = self.tasks.lock().unwrap();
        unsafe {
            debug_assert!(check_list(head.0, self));
            if !ptr::eq((*task).worker_data.load(Ordering::Relaxed), self) {
                return false;
            }
            debug_assert!(!(*task).prev_link.is_null());
            debug_assert_eq!(*(*task).prev_link, task);

            *(*task).prev_link = (*task).next;
            if !(*task).next.is_null() {
                (*(*task).next).prev_link = (*task).prev_link;
            }
            (*task).worker_data.store(ptr::null_mut(), Ordering::Relaxed);
            (*task).prev_link = ptr::null_mut();

            debug_assert!(head.0 != task);
            debug_assert!(check_list(head.0, self));
            true
        }
    }

    /// Detaches every task; returns how many were removed.
    fn drain(&self) -> isize {
        let mut head = self.tasks.lock().unwrap();
        let mut drained = 0;
        while unsafe { self.pop_unprotected(&mut head) }.is_some() {
            drained += 1;
        }
        drained
    }

    unsafe fn push_unprotected(&self, head: &mut LineHead, task: *mut Task) {
        debug_assert!(check_list(head.0, self));
        (*task)
            .worker_data
            .store(self as *const WorkLine as *mut WorkLine, Ordering::Relaxed);
        (*task).next = head.0;
        if !head.0.is_null() {
            (*head.0).prev_link = &mut (*task).next;
        }
        (*task).prev_link = &mut head.0;
        head.0 = task;
        debug_assert!(check_list(head.0, self));
    }

    unsafe fn pop_unprotected(&self, head: &mut LineHead) -> Option<*mut Task> {
        debug_assert!(check_list(head.0, self));
        if head.0.is_null() {
            return None;
        }
        let task = head.0;
        head.0 = (*task).next;
        if !head.0.is_null() {
            (*head.0).prev_link = &mut head.0;
        }
        (*task).prev_link = ptr::null_mut();
        (*task).worker_data.store(ptr::null_mut(), Ordering::Relaxed);
        debug_assert!(check_list(head.0, self));
        Some(task)
    }
}

/// Walks the list checking the intrusive invariants. Only used in debug
/// assertions, under the line's lock.
#[cfg(debug_assertions)]
fn check_list(head: *mut Task, line: &WorkLine) -> bool {
    let mut current = head;
    while !current.is_null() {
        unsafe {
            assert!(!(*current).prev_link.is_null());
            assert_eq!(*(*current).prev_link, current);
            assert_eq!(
                (*current).worker_data.load(Ordering::Relaxed) as *const WorkLine,
                line as *const WorkLine
            );
            current = (*current).next;
        }
    }
    true
}

/// Per-worker wakeup state.
///
/// `wake_requests` counts pending wakeups: a sleeper deposits a `-1` while
/// parked and every notify attempt adds one, so at most one notification is
/// delivered per sleeper and none is ever lost.
#[derive(Debug)]
struct WorkerData {
    wake_requests: AtomicIsize,
    wakeup_token: Mutex<Option<WakeupToken>>,
    work_line_start_index: AtomicUsize,
}

impl WorkerData {
    fn new() -> Self {
        WorkerData {
            wake_requests: AtomicIsize::new(1),
            wakeup_token: Mutex::new(None),
            work_line_start_index: AtomicUsize::new(0),
        }
    }

    /// Wakes this worker if it is the one that needs it. Returns false if a
    /// notification is already in flight (the worker will not park).
    fn try_notify(&self, work_line_hint: usize) -> bool {
        profiling::zone("try_notify");
        // Sync: acquire protects the wakeup token; the caller's push/store
        // provides the release side.
        if self.wake_requests.fetch_add(1, Ordering::Acquire) == 0 {
            // Tell the sleeping thread where to start looking for work.
            self.work_line_start_index
                .store(work_line_hint, Ordering::Relaxed);
            if let Some(token) = &*self.wakeup_token.lock().unwrap() {
                token.notify();
            }
            return true;
        }
        false
    }

    /// Parks until notified (unless a wakeup is already pending or the pool
    /// is stopping). Returns the line to start the next scan from.
    fn sleep(&self, stop_requested: &AtomicBool) -> usize {
        profiling::zone("sleep");
        let helper = SleepHelper::new();
        *self.wakeup_token.lock().unwrap() = Some(helper.get_wakeup_token());
        // Sync: acquire keeps sleep operations after this; release publishes
        // the token to whoever tries to wake us.
        if self.wake_requests.fetch_sub(1, Ordering::AcqRel) == 1 {
            if !stop_requested.load(Ordering::Relaxed) {
                helper.sleep();
            }
        }
        // Invalidate the token so a stale notify cannot leak into the next
        // sleep, then restore the counter.
        *self.wakeup_token.lock().unwrap() = None;
        self.wake_requests.store(1, Ordering::Release);
        self.work_line_start_index.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct PoolState {
    work_lines: Box<[WorkLine]>,
    workers: Box<[WorkerData]>,
    num_tasks: AtomicIsize,
    line_to_push_to: AtomicU32,
    stop_requested: AtomicBool,
    workers_exited: AtomicUsize,
}

impl PoolState {
    /// Accounts for one new task and wakes one worker, preferring the line
    /// the task went to.
    fn notify_one(&self, work_line_hint: usize) {
        let old = self.num_tasks.fetch_add(1, Ordering::Relaxed);
        if old <= self.workers.len() as isize {
            for worker in self.workers.iter() {
                if worker.try_notify(work_line_hint) {
                    return;
                }
            }
        }
    }
}

/// A pool of worker threads, one work line per worker.
///
/// Tasks are raw intrusive nodes owned by the caller; they must stay alive
/// and pinned until executed or extracted. Destroying a pool that still
/// holds tasks aborts the process: draining is the user's responsibility.
#[derive(Debug)]
pub struct ThreadPool {
    state: Arc<PoolState>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Starts `thread_count` workers.
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0);
        tracing::debug!(thread_count, "starting thread pool");

        let state = Arc::new(PoolState {
            work_lines: (0..thread_count).map(|_| WorkLine::new()).collect(),
            workers: (0..thread_count).map(|_| WorkerData::new()).collect(),
            num_tasks: AtomicIsize::new(0),
            line_to_push_to: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            workers_exited: AtomicUsize::new(0),
        });

        let handles = (0..thread_count)
            .map(|index| {
                let state = state.clone();
                thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || thread_main(state, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        profiling::define_counter_track("num_tasks");

        ThreadPool {
            state,
            handles: Mutex::new(handles),
        }
    }

    /// Starts a pool sized by `CONCORE_MAX_CONCURRENCY`, falling back to the
    /// hardware concurrency.
    pub fn with_default_concurrency() -> Self {
        ThreadPool::new(concurrency())
    }

    /// Queues a task for execution.
    ///
    /// Prefers a non-blocking push, trying every line round robin from a
    /// rotating start; falls back to a blocking push on the selected line.
    ///
    /// # Safety
    ///
    /// `task` must be valid, detached, and must not move or be freed until
    /// its function has run or [`extract_task`](Self::extract_task) returned
    /// true for it.
    pub unsafe fn enqueue(&self, task: *mut Task) {
        profiling::zone("enqueue");
        if self.state.stop_requested.load(Ordering::Relaxed) {
            // A task enqueued past shutdown would silently leak.
            tracing::error!("task enqueued on a stopped pool");
            std::process::abort();
        }

        (*task).next = ptr::null_mut();
        (*task).prev_link = ptr::null_mut();

        // u32 so the round-robin counter wraps around safely.
        let line_count = self.state.work_lines.len() as u32;
        let index = self.state.line_to_push_to.fetch_add(1, Ordering::Relaxed) % line_count;

        for i in 0..line_count {
            let current = ((index + i) % line_count) as usize;
            if self.state.work_lines[current].try_push(task) {
                self.state.notify_one(current);
                return;
            }
        }
        // Every line was contended; force-push to the selected one.
        let current = index as usize;
        self.state.work_lines[current].push(task);
        self.state.notify_one(current);
    }

    /// Removes a queued task before any worker picks it up. Returns false if
    /// it is already detached.
    ///
    /// # Safety
    ///
    /// `task` must be valid and either detached or owned by one of this
    /// pool's lines.
    pub unsafe fn extract_task(&self, task: *mut Task) -> bool {
        profiling::zone("extract_task");
        let line = (*task).worker_data.load(Ordering::Relaxed);
        let extracted = !line.is_null() && (*line).extract(task);
        if extracted {
            // Sync: publish all prior stores to observers of the count.
            self.state.num_tasks.fetch_sub(1, Ordering::Release);
        }
        extracted
    }

    /// Detaches every queued task without executing it.
    pub fn clear(&self) {
        for line in self.state.work_lines.iter() {
            let drained = line.drain();
            if drained > 0 {
                self.state.num_tasks.fetch_sub(drained, Ordering::Release);
            }
        }
    }

    /// Stops and joins every worker thread.
    ///
    /// Safe to call from a flow that was carried onto a worker thread by an
    /// inversion: the caller lends its thread to the swap protocol until
    /// every worker flow has exited on its original thread, and finishes on
    /// the thread it originally started on.
    pub fn join(&self) {
        profiling::zone("join");
        // Sync: publish all previous state before joining.
        self.state.stop_requested.store(true, Ordering::Release);
        for worker in self.state.workers.iter() {
            worker.try_notify(0);
        }

        let thread_count = self.state.workers.len();
        while self.state.workers_exited.load(Ordering::Acquire) < thread_count {
            inversion_checkpoint();
            thread::yield_now();
        }

        let handles = mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("thread pool stopped");
    }

    pub(crate) fn num_tasks(&self) -> isize {
        self.state.num_tasks.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.num_tasks() > 0 {
            // Users shall drain the tasks before destroying the pool.
            tracing::error!("thread pool destroyed with tasks still queued");
            std::process::abort();
        }
        self.join();
    }
}

/// The dispatch loop run by every worker thread.
fn thread_main(state: Arc<PoolState>, thread_index: usize) {
    profiling::emit_thread_name_and_stack("worker");
    profiling::zone_instant("worker thread start");
    tracing::trace!(worker = thread_index, "worker thread start");

    // We need to exit on the same thread.
    let snapshot = ThreadSnapshot::new();

    let line_count = state.work_lines.len();
    let mut work_line_hint = thread_index;
    while !state.stop_requested.load(Ordering::Relaxed) {
        // First check whether this thread owes itself to somebody else.
        inversion_checkpoint();

        // Sync: don't move any sleep operations before this load.
        if state.num_tasks.load(Ordering::Acquire) == 0 {
            work_line_hint = state.workers[thread_index].sleep(&state.stop_requested);
        }

        let mut to_execute: *mut Task = ptr::null_mut();
        let mut line_index = 0;

        // Scan twice around so lines that lost a try_lock race on the first
        // pass get a second chance.
        for i in 0..2 * line_count {
            line_index = (i + work_line_hint) % line_count;
            if let Some(task) = state.work_lines[line_index].try_pop() {
                to_execute = task;
                break;
            }
        }

        if !to_execute.is_null() {
            state.num_tasks.fetch_sub(1, Ordering::Relaxed);
            profiling::zone("execute");
            unsafe { ((*to_execute).function)(to_execute, line_index) };
            continue;
        }
    }

    // Ensure we finish on the same thread.
    snapshot.revert();
    state.workers_exited.fetch_add(1, Ordering::Release);
    profiling::zone_instant("worker thread end");
    tracing::trace!(worker = thread_index, "worker thread end");
}

/// The desired level of concurrency: the `CONCORE_MAX_CONCURRENCY`
/// environment variable if set to a positive integer, otherwise the hardware
/// concurrency, otherwise 1.
fn concurrency() -> usize {
    if let Ok(value) = env::var("CONCORE_MAX_CONCURRENCY") {
        if let Ok(parsed) = value.parse::<usize>() {
            if parsed > 0 {
                return parsed;
            }
        }
    }
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

static GLOBAL_POOL: OnceLock<ThreadPool> = OnceLock::new();

/// The process-wide pool used by `spawn`. Built lazily on first use.
pub fn global_thread_pool() -> &'static ThreadPool {
    GLOBAL_POOL.get_or_init(ThreadPool::with_default_concurrency)
}
