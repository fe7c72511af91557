//! Fixed pools of event-loop executors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::available_parallelism;
use std::time::{Duration, Instant};

use log::debug;

use crate::executor::{current_executor_id, EventExecutor, ExecutorBuilder};

/// A fixed pool of [`EventExecutor`]s.
///
/// Endpoints are assigned to exactly one executor at registration and stay
/// on it for their whole lifetime; different endpoints run fully in
/// parallel on different executors.
pub struct EventLoopGroup {
    executors: Vec<EventExecutor>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Creates a group of `threads` executors; `0` sizes the group to the
    /// hardware parallelism.
    pub fn new(threads: usize) -> Self {
        GroupBuilder::new().threads(threads).build()
    }

    /// Starts building a group.
    pub fn builder() -> GroupBuilder {
        GroupBuilder::new()
    }

    /// Number of executors in the group.
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Always false; groups have at least one executor.
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Picks the executor for the next registration.
    ///
    /// Round-robin over the pool, except when the caller is already running
    /// on one of this group's event loops: then that same executor is
    /// returned, so work spawned from within a handler stays on the
    /// endpoint's thread.
    pub fn next(&self) -> &EventExecutor {
        if let Some(current) = current_executor_id() {
            if let Some(own) = self.executors.iter().find(|e| e.id() == current) {
                return own;
            }
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.executors.len();
        &self.executors[index]
    }

    /// Binds a new endpoint to an executor for its lifetime and returns the
    /// binding.
    pub fn register(&self) -> EventExecutor {
        self.next().clone()
    }

    /// All executors, for inspection.
    pub fn executors(&self) -> &[EventExecutor] {
        &self.executors
    }

    /// Initiates graceful shutdown on every executor.
    ///
    /// Use [`await_termination`](EventLoopGroup::await_termination) to block
    /// until the whole group terminated. This is the only supported
    /// shutdown path and must complete before process exit for
    /// deterministic drain semantics.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> &Self {
        for executor in &self.executors {
            executor.shutdown_gracefully(quiet_period, timeout);
        }
        self
    }

    /// Blocks until every executor terminated or `timeout` elapsed; returns
    /// whether full termination was observed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for executor in &self.executors {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !executor.await_termination(remaining) {
                return false;
            }
        }
        debug!("event loop group fully terminated");
        true
    }
}

/// Configures and builds an [`EventLoopGroup`].
#[derive(Debug, Default)]
pub struct GroupBuilder {
    threads: usize,
    name_prefix: Option<String>,
    pin_cores: bool,
}

impl GroupBuilder {
    /// Creates a builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executors; `0` (the default) uses the hardware
    /// parallelism.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Prefix for the worker thread names, suffixed with the loop index.
    pub fn name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = Some(String::from(prefix));
        self
    }

    /// Pins each worker thread to one CPU core, in core id order.
    pub fn pin_cores(mut self, pin: bool) -> Self {
        self.pin_cores = pin;
        self
    }

    /// Builds the group. Worker threads start lazily on first use.
    pub fn build(self) -> EventLoopGroup {
        let threads = if self.threads == 0 {
            available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.threads
        };
        let prefix = self.name_prefix.unwrap_or_else(|| String::from("strand-loop"));
        let cores = if self.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let executors = (0..threads)
            .map(|i| {
                let mut builder = ExecutorBuilder::new().name(&format!("{prefix}-{i}"));
                if let Some(core_id) = cores.get(i % cores.len().max(1)).copied() {
                    builder = builder.core_id(core_id);
                }
                builder.build()
            })
            .collect();

        EventLoopGroup {
            executors,
            next: AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn round_robin_cycles_through_the_pool() {
        let group = EventLoopGroup::new(3);
        let first = group.next().id();
        let second = group.next().id();
        let third = group.next().id();
        let wrapped = group.next().id();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, wrapped);
        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_termination(Duration::from_secs(5));
    }

    #[test]
    fn next_prefers_the_calling_event_loop() {
        let group = Arc::new(EventLoopGroup::new(2));
        let bound = group.register();
        let observed = Arc::new(AtomicU64::new(u64::MAX));

        let group_inside = group.clone();
        let seen = observed.clone();
        bound
            .submit(move || {
                // From inside a loop of this group, next() must return that
                // same loop regardless of the round-robin cursor.
                for _ in 0..5 {
                    seen.store(group_inside.next().id(), Ordering::SeqCst);
                }
            })
            .unwrap()
            .wait();

        assert_eq!(observed.load(Ordering::SeqCst), bound.id());
        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_termination(Duration::from_secs(5));
    }

    #[test]
    fn shutdown_fans_out_to_all_executors() {
        let group = EventLoopGroup::new(2);
        for executor in group.executors() {
            executor.execute(|| {}).unwrap();
        }
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
        assert!(group.await_termination(Duration::from_secs(5)));
        for executor in group.executors() {
            assert!(executor.is_terminated());
        }
    }
}
