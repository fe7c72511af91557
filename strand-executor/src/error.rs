use thiserror::Error;

/// Errors produced by executor operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor no longer accepts this kind of work.
    ///
    /// `execute` is rejected once the executor terminated; `schedule` is
    /// rejected as soon as graceful shutdown begins.
    #[error("task rejected: executor \"{executor}\" is {state}")]
    Rejected {
        /// Name of the rejecting executor.
        executor: String,
        /// Human-readable state at rejection time.
        state: &'static str,
    },
}
