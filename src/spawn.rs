//! Spawning asynchronous work and rejoining it.
//!
//! [`spawn`] starts a closure that may run in parallel with its caller and
//! returns a future whose `join` rejoins the two flows. The rendezvous is a
//! race on one atomic counter:
//!
//! - If the spawned work finishes first, `join` returns immediately.
//! - If the caller arrives first and the task is still queued, the caller
//!   pulls it out and runs it inline (cooperative steal).
//! - If a worker already owns the task, the caller parks its continuation
//!   and lends its physical thread to the worker's dispatch loop; when the
//!   work completes, the worker thread picks the caller's flow up instead.
//!   The two threads have swapped logical flows: a *thread inversion*. The
//!   awaiting flow therefore always proceeds promptly on *some* thread, but
//!   must not assume thread-local identity across `join`.

use std::cell::{Cell, UnsafeCell};
use std::mem::{ManuallyDrop, MaybeUninit};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::context::{self, Continuation, MmapStackAllocator};
use crate::pool::{global_thread_pool, Task, ThreadPool};
use crate::profiling;
use crate::suspension::SuspensionSlot;

/// Rendezvous states: the originator adds 2 when it reaches `join`, the
/// spawned side adds 1 when the work completes. Terminal value is 3, or 2
/// when the originator stole the task and the spawned side never ran.
const NOT_STARTED: i32 = 0;
const ASYNC_COMPLETED: i32 = 1;
const MAIN_COMPLETED: i32 = 2;

/// Raw pointer wrapper so frame pointers can cross into coroutine closures.
struct SendPtr<T>(*mut T);

unsafe impl<T> Send for SendPtr<T> {}

/// The type-erased heart of a spawn operation.
///
/// Lives at offset 0 of the typed frame so the task pointer handed to the
/// pool downcasts back to the full frame.
#[repr(C)]
pub(crate) struct SpawnFrameBase {
    /// How the pool sees this frame.
    task: UnsafeCell<Task>,
    /// The rendezvous state.
    sync_state: AtomicI32,
    /// Where the spawning flow parked its continuation.
    originator: SuspensionSlot,
    /// Where the spawned flow parked the worker's dispatch continuation.
    secondary: SuspensionSlot,
    /// Type-erased user body; writes the result into the typed frame.
    user_function: unsafe fn(*mut SpawnFrameBase),
    /// Releases the task side's ownership of the frame, if it holds any.
    release_task_ref: unsafe fn(*mut SpawnFrameBase),
}

impl SpawnFrameBase {
    fn new(
        user_function: unsafe fn(*mut SpawnFrameBase),
        release_task_ref: unsafe fn(*mut SpawnFrameBase),
    ) -> Self {
        SpawnFrameBase {
            task: UnsafeCell::new(Task::new(execute_spawn_task)),
            sync_state: AtomicI32::new(NOT_STARTED),
            originator: SuspensionSlot::new(),
            secondary: SuspensionSlot::new(),
            user_function,
            release_task_ref,
        }
    }
}

/// Task body run by a worker: moves the spawned work onto a fresh coroutine
/// stack so the worker's dispatch loop stays adoptable by the originator.
unsafe extern "C" fn execute_spawn_task(task: *mut Task, _worker_index: usize) {
    profiling::zone("execute_spawn_task");
    let frame = SendPtr(task.cast::<SpawnFrameBase>());
    let _ = context::callcc(MmapStackAllocator::default(), move |worker| {
        let frame = frame.0;
        // Publish the dispatch continuation first: an originator that parks
        // adopts it, keeping this worker's loop running on its thread.
        (*frame).secondary.deposit(worker);

        ((*frame).user_function)(frame);

        // The release must not read the frame after the rendezvous decides
        // the originator may free it.
        let release = (*frame).release_task_ref;
        let next = on_async_complete(frame, worker);
        release(frame);
        next
    })
    .expect("failed to allocate stack for spawned task");
}

/// Spawned-side half of the rendezvous; returns the continuation the
/// coroutine exits to.
unsafe fn on_async_complete(frame: *mut SpawnFrameBase, worker: Continuation) -> Continuation {
    // Sync: the suspension-slot deposits above are release stores; the
    // acq_rel exchange makes them (and the result write) visible to
    // whichever side arrives second.
    let previous = (*frame)
        .sync_state
        .fetch_add(ASYNC_COMPLETED, Ordering::AcqRel);
    if previous == NOT_STARTED {
        // The originator has not reached its join; it will take the fast
        // path. Resume the dispatch loop on this thread.
        return worker;
    }

    // The originator is parked: thread inversion. Its flow continues on this
    // thread, while the thread it parked on has adopted our dispatch loop.
    debug_assert_eq!(previous, MAIN_COMPLETED);
    tracing::trace!("thread inversion at spawn rendezvous");
    (*frame).originator.take()
}

/// Originator-side half of the rendezvous. On return the spawned work has
/// been executed and its result written, though possibly on a different
/// physical thread than the one this was called on.
unsafe fn await_impl(frame: *mut SpawnFrameBase, pool: &ThreadPool) {
    profiling::zone("await");
    let previous = (*frame)
        .sync_state
        .fetch_add(MAIN_COMPLETED, Ordering::AcqRel);
    if previous == ASYNC_COMPLETED {
        // The spawned work already finished.
        return;
    }
    debug_assert_eq!(previous, NOT_STARTED);

    // We arrived first. If no worker claimed the task yet, run it inline;
    // the spawned side then never executes and the state stays at 2.
    if pool.extract_task((*frame).task.get()) {
        ((*frame).user_function)(frame);
        ((*frame).release_task_ref)(frame);
        return;
    }

    // A worker owns the task. Park this flow for the worker to continue and
    // adopt the worker's dispatch loop in exchange. The deposit must be the
    // last frame access here: the instant it lands, the worker may resume
    // our flow, which returns from the join and frees the frame.
    let send = SendPtr(frame);
    let _ = context::callcc(MmapStackAllocator::default(), move |ours| {
        let frame = send.0;
        let dispatch = (*frame).secondary.take();
        (*frame).originator.deposit(ours);
        dispatch
    })
    .expect("failed to allocate stack to park awaiting flow");
    // Resumed by the worker after the inversion.
}

/// Write-once result cell. The rendezvous guarantees at most one write and
/// at most one read, in that order; `()` results occupy no storage beyond
/// the occupancy flag.
struct ValueHolder<R> {
    value: UnsafeCell<MaybeUninit<R>>,
    occupied: Cell<bool>,
}

impl<R> ValueHolder<R> {
    fn empty() -> Self {
        ValueHolder {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            occupied: Cell::new(false),
        }
    }

    unsafe fn set(&self, value: R) {
        (*self.value.get()).write(value);
        self.occupied.set(true);
    }

    unsafe fn take(&self) -> R {
        debug_assert!(self.occupied.get());
        self.occupied.set(false);
        (*self.value.get()).assume_init_read()
    }
}

impl<R> Drop for ValueHolder<R> {
    fn drop(&mut self) {
        if self.occupied.get() {
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

/// Full spawn frame: the protocol base, the user closure, and the result.
#[repr(C)]
pub(crate) struct SpawnFrame<F, R> {
    base: SpawnFrameBase,
    function: UnsafeCell<ManuallyDrop<F>>,
    result: ValueHolder<R>,
}

// The frame is shared between the originator and one worker; every access
// is serialized by the rendezvous protocol and the pool's locks.
unsafe impl<F: Send, R: Send> Send for SpawnFrame<F, R> {}
unsafe impl<F: Send, R: Send> Sync for SpawnFrame<F, R> {}

impl<F, R> SpawnFrame<F, R>
where
    F: FnOnce() -> R,
{
    fn new(function: F, release_task_ref: unsafe fn(*mut SpawnFrameBase)) -> Self {
        SpawnFrame {
            base: SpawnFrameBase::new(run_user_function::<F, R>, release_task_ref),
            function: UnsafeCell::new(ManuallyDrop::new(function)),
            result: ValueHolder::empty(),
        }
    }
}

/// Downcasts the base pointer and runs the stored closure exactly once.
unsafe fn run_user_function<F, R>(base: *mut SpawnFrameBase)
where
    F: FnOnce() -> R,
{
    let frame = base.cast::<SpawnFrame<F, R>>();
    let function = ManuallyDrop::take(&mut *(*frame).function.get());
    (*frame).result.set(function());
}

/// Non-escaping frames are owned by the future alone.
unsafe fn release_nothing(_base: *mut SpawnFrameBase) {}

/// Escaping frames are co-owned by the enqueued task; this drops its share.
unsafe fn release_task_arc<F, R>(base: *mut SpawnFrameBase) {
    drop(Arc::from_raw(base.cast::<SpawnFrame<F, R>>().cast_const()));
}

/// A future for work started by [`spawn`].
///
/// `join` consumes the future, so it can only be awaited once. Dropping the
/// future without joining first completes the rendezvous (discarding the
/// result), so the spawned work always runs to completion.
pub struct SpawnFuture<F, R> {
    frame: Option<Box<SpawnFrame<F, R>>>,
    pool: &'static ThreadPool,
}

impl<F, R> SpawnFuture<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn spawn_with(pool: &'static ThreadPool, function: F) -> Self {
        profiling::zone("spawn");
        let frame = Box::new(SpawnFrame::new(function, release_nothing));
        unsafe { pool.enqueue(frame.base.task.get()) };
        SpawnFuture {
            frame: Some(frame),
            pool,
        }
    }
}

impl<F, R> SpawnFuture<F, R> {
    /// Awaits the spawned computation and returns its result.
    ///
    /// If the work is already done this returns immediately. Otherwise the
    /// caller either runs the still-queued work inline or swaps flows with
    /// the executing worker; in the latter case the code after `join` runs
    /// on a different physical thread.
    pub fn join(mut self) -> R {
        let frame = self.frame.take().expect("frame present until joined");
        unsafe {
            await_impl(frame_base(&frame), self.pool);
            frame.result.take()
        }
    }
}

impl<F, R> Drop for SpawnFuture<F, R> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            // The task may still be queued or running; rejoin before the
            // frame is freed. The result is dropped with the frame.
            unsafe { await_impl(frame_base(&frame), self.pool) };
        }
    }
}

/// A future for work started by [`escaping_spawn`]: movable across threads
/// and droppable without joining, at the cost of shared frame ownership.
pub struct EscapingSpawnFuture<F, R> {
    frame: Option<Arc<SpawnFrame<F, R>>>,
    pool: &'static ThreadPool,
}

unsafe impl<F: Send, R: Send> Send for EscapingSpawnFuture<F, R> {}

impl<F, R> EscapingSpawnFuture<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn spawn_with(pool: &'static ThreadPool, function: F) -> Self {
        profiling::zone("spawn");
        let frame = Arc::new(SpawnFrame::new(function, release_task_arc::<F, R>));
        // The task side holds its own share; whoever releases last frees.
        let _task_share = Arc::into_raw(Arc::clone(&frame));
        unsafe {
            pool.enqueue(frame.base.task.get());
        }
        EscapingSpawnFuture {
            frame: Some(frame),
            pool,
        }
    }

    /// Awaits the spawned computation and returns its result. Same
    /// semantics as [`SpawnFuture::join`].
    pub fn join(mut self) -> R {
        let frame = self.frame.take().expect("frame present until joined");
        unsafe {
            await_impl(frame_base(&frame), self.pool);
            frame.result.take()
        }
    }
}

fn frame_base<F, R>(frame: &SpawnFrame<F, R>) -> *mut SpawnFrameBase {
    &frame.base as *const SpawnFrameBase as *mut SpawnFrameBase
}

/// Spawns `function` on the global thread pool, returning a future that must
/// be joined (or dropped) before the result is needed.
///
/// # Examples
///
/// ```
/// let future = coriolis::spawn(|| 6 * 7);
/// assert_eq!(future.join(), 42);
/// ```
pub fn spawn<F, R>(function: F) -> SpawnFuture<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    SpawnFuture::spawn_with(global_thread_pool(), function)
}

/// Like [`spawn`], but the returned future may outlive the spawning scope
/// and move across threads.
///
/// # Examples
///
/// ```
/// let future = coriolis::escaping_spawn(|| "hello".to_string());
/// let moved = std::thread::spawn(move || future).join().unwrap();
/// assert_eq!(moved.join(), "hello");
/// ```
pub fn escaping_spawn<F, R>(function: F) -> EscapingSpawnFuture<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    EscapingSpawnFuture::spawn_with(global_thread_pool(), function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use impls::impls;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn leaked_pool(thread_count: usize) -> &'static ThreadPool {
        Box::leak(Box::new(ThreadPool::new(thread_count)))
    }

    #[test]
    fn fast_path_when_work_finishes_first() {
        let pool = leaked_pool(2);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        let future = SpawnFuture::spawn_with(pool, move || {
            flag.store(true, Ordering::Release);
            42
        });
        while !done.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(5));

        assert_eq!(future.join(), 42);
        pool.join();
    }

    /// The join arrives while a worker is executing the body: the two
    /// threads swap flows, and the pool's join swaps them back.
    #[test]
    fn parked_join_inverts_threads() {
        let pool = leaked_pool(1);
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();

        let future = SpawnFuture::spawn_with(pool, move || {
            flag.store(true, Ordering::Release);
            thread::sleep(Duration::from_millis(10));
            13
        });
        // Make sure the worker owns the task before we join.
        while !started.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }

        let before = thread::current().id();
        assert_eq!(future.join(), 13);
        assert_ne!(
            thread::current().id(),
            before,
            "a parked join continues on the worker's thread"
        );

        pool.join();
        assert_eq!(
            thread::current().id(),
            before,
            "joining the pool reverts every flow to its original thread"
        );
    }

    /// The join arrives before any worker claims the task: the task is
    /// extracted and run inline, with no inversion.
    #[test]
    fn unclaimed_task_is_stolen_inline() {
        let pool = leaked_pool(1);

        // Keep the only worker busy so the second task stays queued.
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let blocker = SpawnFuture::spawn_with(pool, move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();

        let before = thread::current().id();
        let future = SpawnFuture::spawn_with(pool, || 7);
        assert_eq!(future.join(), 7);
        assert_eq!(
            thread::current().id(),
            before,
            "a stolen task runs on the awaiting thread"
        );

        release_tx.send(()).unwrap();
        blocker.join();
        pool.join();
    }

    #[test]
    fn many_spawns_sum() {
        let pool = leaked_pool(4);

        let futures: Vec<_> = (0..1000usize)
            .map(|i| SpawnFuture::spawn_with(pool, move || i))
            .collect();
        let total: usize = futures.into_iter().map(|future| future.join()).sum();

        assert_eq!(total, 999 * 1000 / 2);
        pool.join();
    }

    #[test]
    fn unit_results_take_no_slot() {
        let pool = leaked_pool(2);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let future = SpawnFuture::spawn_with(pool, move || flag.store(true, Ordering::Release));
        future.join();

        assert!(ran.load(Ordering::Acquire));
        pool.join();
    }

    #[test]
    fn nested_spawn_on_single_worker() {
        let pool = leaked_pool(1);

        let future = SpawnFuture::spawn_with(pool, move || {
            let inner = SpawnFuture::spawn_with(pool, || 21);
            inner.join() * 2
        });

        assert_eq!(future.join(), 42);
        pool.join();
    }

    #[test]
    fn dropping_unjoined_future_completes_the_work() {
        let pool = leaked_pool(1);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let future = SpawnFuture::spawn_with(pool, move || {
            flag.store(true, Ordering::Release);
            5
        });
        drop(future);

        assert!(
            ran.load(Ordering::Acquire),
            "drop rejoins before freeing the frame"
        );
        pool.join();
    }

    #[test]
    fn escaping_future_moves_between_holders() {
        let pool = leaked_pool(2);

        let future = EscapingSpawnFuture::spawn_with(pool, || "hello".to_string());
        let future = thread::spawn(move || future).join().unwrap();

        assert_eq!(future.join(), "hello");
        pool.join();
    }

    #[test]
    fn escaping_future_dropped_without_join() {
        let pool = leaked_pool(1);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let future = EscapingSpawnFuture::spawn_with(pool, move || {
            flag.store(true, Ordering::Release);
        });
        drop(future);

        while !ran.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(5));
        pool.join();
    }

    #[test]
    fn trait_implementations() {
        assert!(impls!(SpawnFuture<fn() -> i32, i32>: Send));
        assert!(impls!(EscapingSpawnFuture<fn() -> i32, i32>: Send));
    }
}
