//! Structured concurrency on stackful coroutines with thread inversion.
//!
//! [`spawn`] starts a closure that may run in parallel with its caller on a
//! shared pool of worker threads. Calling `join` on the returned future
//! rejoins the two flows: if the work already finished the join returns
//! immediately, and if not, the caller either runs the still-queued work
//! inline or swaps physical threads with the worker executing it. Either
//! way the awaiting flow proceeds promptly instead of blocking a thread.
//!
//! The thread swap (a *thread inversion*) means code after a join may be
//! running on a different OS thread than before it. Don't cache
//! thread-local state across a join.
//!
//! # Examples
//!
//! ### Run work concurrently with the caller
//! ```
//! let future = coriolis::spawn(|| expensive());
//! let here = cheap();
//! assert_eq!(future.join() + here, 43);
//!
//! fn expensive() -> i32 { 42 }
//! fn cheap() -> i32 { 1 }
//! ```
//!
//! ### Hand a future to another owner
//! ```
//! let future = coriolis::escaping_spawn(|| "hello".to_string());
//! let future = std::thread::spawn(move || future).join().unwrap();
//! assert_eq!(future.join(), "hello");
//! ```
//!
//! The pool is sized from the `CONCORE_MAX_CONCURRENCY` environment
//! variable, falling back to the hardware concurrency.

mod context;
mod inversion;
mod pool;
mod profiling;
mod sleep;
mod spawn;
mod suspension;

pub use context::{MmapStackAllocator, StackAllocator, StackDesc};
pub use inversion::inversion_checkpoint;
pub use pool::{global_thread_pool, Task, TaskFunction, ThreadPool};
pub use spawn::{escaping_spawn, spawn, EscapingSpawnFuture, SpawnFuture};
