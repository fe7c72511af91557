//! # Strand Executor - Single-Threaded Event Loops
//!
//! `strand-executor` provides the execution layer of the strand framework:
//! cooperatively scheduled, single-threaded event loops and fixed groups of
//! them.
//!
//! ## Model
//!
//! An [`EventExecutor`] owns one logical worker thread, one ready-task queue
//! and one deadline-ordered timer queue. Work submitted with
//! [`execute`](EventExecutor::execute) runs strictly one task at a time, in
//! submission order per submitting thread; work scheduled with
//! [`schedule`](EventExecutor::schedule) runs in non-decreasing deadline
//! order with ties broken by submission sequence. No two tasks of the same
//! executor ever run concurrently - that guarantee is what lets pipeline
//! handlers go entirely without locks.
//!
//! An [`EventLoopGroup`] is a fixed pool of executors. Each endpoint is
//! bound to exactly one executor at registration and stays there for its
//! lifetime; unrelated endpoints run fully in parallel on different
//! executors.
//!
//! ## Blocking
//!
//! Conceptually blocking operations never block the loop: they are
//! expressed as continuations re-entering the queue when ready. The worker
//! thread only idles when it is genuinely out of work, bounded by a
//! periodic wake so shutdown is observed promptly.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use strand_executor::EventExecutor;
//!
//! let executor = EventExecutor::builder().name("demo-loop").build();
//! let completion = executor.submit(|| println!("on the loop")).unwrap();
//! completion.wait();
//!
//! executor
//!     .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
//!     .wait();
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod error;
mod executor;
mod group;

pub use error::ExecutorError;
pub use executor::{EventExecutor, ExecutorBuilder, ExecutorState, ScheduledHandle};
pub use group::{EventLoopGroup, GroupBuilder};
