use std::error::Error;
use std::sync::Arc;

use strand_buf::BufError;
use strand_executor::ExecutorError;
use thiserror::Error;

/// Errors raised by pipeline operations and propagated as error events.
///
/// Lifecycle errors (duplicate name, remove-absent, double-add of a
/// non-shareable handler) are synchronous at the call site. Errors fired
/// through the pipeline reach the tail sentinel when no handler deals with
/// them earlier; the tail logs them with endpoint context and closes the
/// endpoint.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A handler with this name is already in the pipeline.
    #[error("duplicate handler name \"{0}\"")]
    DuplicateName(String),

    /// No handler with this name is in the pipeline.
    #[error("no such handler \"{0}\"")]
    NotFound(String),

    /// A non-shareable handler instance is already attached elsewhere.
    #[error("handler \"{0}\" is not shareable and is already attached")]
    NotShareable(String),

    /// The endpoint is closed; no further outbound operations are possible.
    #[error("endpoint is closed")]
    Closed,

    /// The bound executor rejected a marshalled operation.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// A buffer operation failed while handling an event.
    #[error(transparent)]
    Buf(#[from] BufError),

    /// A message of an unexpected type reached a typed seam.
    #[error("unexpected message type in handler \"{0}\"")]
    UnexpectedMessage(String),

    /// Any other error raised by a handler, carried through the pipeline.
    ///
    /// The original error stays downcastable, so a codec's own error kind
    /// passes through unchanged.
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync>),
}

impl PipelineError {
    /// Wraps an arbitrary handler error for propagation.
    pub fn other(error: impl Error + Send + Sync + 'static) -> Self {
        Self::Other(Arc::new(error))
    }

    /// Attempts to view the carried error as a concrete type.
    pub fn downcast_other<T: Error + 'static>(&self) -> Option<&T> {
        match self {
            Self::Other(inner) => inner.downcast_ref::<T>(),
            _ => None,
        }
    }
}
