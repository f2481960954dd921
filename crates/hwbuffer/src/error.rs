#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer handle is null or was rejected by the platform")]
    InvalidHandle,
    #[error("failed to lock buffer for CPU access (status {status})")]
    LockFailed { status: i32 },
    #[error("failed to allocate buffer (status {status})")]
    AllocationFailed { status: i32 },
}
