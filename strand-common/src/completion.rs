//! One-shot completion handles.
//!
//! A [`Completion`] is the waitable side of deferred work: scheduled tasks,
//! graceful shutdowns and outbound pipeline writes all resolve one. The
//! first outcome wins; later attempts to complete are no-ops, which makes
//! cancellation races benign.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// The terminal state of a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The work ran to completion.
    Succeeded,
    /// The work failed; the string carries the failure description.
    Failed(String),
    /// The work was cancelled before it ran.
    Cancelled,
}

impl Outcome {
    /// Whether this outcome is [`Outcome::Succeeded`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<Option<Outcome>>,
    signal: Condvar,
}

/// A cloneable handle to a one-shot result slot.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// Creates an unresolved completion.
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, outcome: Outcome) -> bool {
        let mut state = self.inner.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(outcome);
        self.inner.signal.notify_all();
        true
    }

    /// Marks the completion succeeded. Returns whether this call resolved it.
    pub fn succeed(&self) -> bool {
        self.resolve(Outcome::Succeeded)
    }

    /// Marks the completion failed. Returns whether this call resolved it.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.resolve(Outcome::Failed(reason.into()))
    }

    /// Marks the completion cancelled. Returns whether this call resolved it.
    pub fn cancel(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    /// Returns the outcome without blocking, if resolved.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.state.lock().clone()
    }

    /// Whether the completion has resolved.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// Whether the completion resolved as cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome(), Some(Outcome::Cancelled))
    }

    /// Blocks until the completion resolves.
    pub fn wait(&self) -> Outcome {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = state.clone() {
                return outcome;
            }
            self.inner.signal.wait(&mut state);
        }
    }

    /// Blocks until the completion resolves or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = state.clone() {
                return Some(outcome);
            }
            if self.inner.signal.wait_until(&mut state, deadline).timed_out() {
                return state.clone();
            }
        }
    }
}
