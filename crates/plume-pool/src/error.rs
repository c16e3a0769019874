use thiserror::Error;

/// Everything that can go wrong with a pooled request. This is the single
/// failure channel of `WorkerPool::process_request`; the pool never panics
/// or throws synchronously for transient conditions.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No terminal message arrived within the configured window. The request
    /// is abandoned; a late response will be dropped.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    /// The owning execution context crashed or exited abnormally. Contained:
    /// the context is replaced and the pool keeps serving.
    #[error("execution context {index} failed: {reason}")]
    WorkerFailed { index: usize, reason: String },

    /// The execution context reported a failure for this request.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The execution context sent a message the pool cannot interpret,
    /// which indicates a context/manager version mismatch.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The pool is shutting down; outstanding and new requests are rejected
    /// immediately.
    #[error("pool is shutting down")]
    ShuttingDown,
}
