//! Errors surfaced by synchronous reads of an allocation request.
//!
//! Capacity exhaustion is never an error: a request that does not fit is queued.

/// Failure of a synchronous (fail-fast or forced) allocation read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// No allocation is available yet. Retry asynchronously or force.
    #[error("Allocation not resolved yet")]
    ResolutionPending,
    /// A previous synchronous read of this request failed; the failure is repeated.
    #[error("Allocation previously failed: {0}")]
    AlreadyFailed(Box<PoolError>),
    /// The forced resolver ran but no allocation could be read afterwards.
    #[error("Forced resolution produced no allocation")]
    ResolverMissing,
    /// The pool was dropped before the request was granted.
    #[error("Pool closed before the allocation was granted")]
    PoolClosed,
}

impl PoolError {
    /// Wrap a cached failure for a repeated read.
    ///
    /// An error that is already `AlreadyFailed` is not wrapped twice.
    pub(crate) fn repeated(self) -> Self {
        match self {
            Self::AlreadyFailed(_) => self,
            other => Self::AlreadyFailed(Box::new(other)),
        }
    }
}
