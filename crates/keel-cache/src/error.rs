pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the persistent store and its access worker.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("cache access worker has been stopped")]
    WorkerStopped,

    #[error("cache access worker task panicked: {message}")]
    WorkerPanicked { message: String },

    #[error("cache access worker exited before completing the request")]
    WorkerDisconnected,

    #[error("in-memory cache {name:?} was opened with a different value type")]
    CacheTypeMismatch { name: String },
}
