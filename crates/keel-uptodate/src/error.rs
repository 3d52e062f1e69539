pub type Result<T> = std::result::Result<T, UpToDateError>;

#[derive(Debug, thiserror::Error)]
pub enum UpToDateError {
    #[error(transparent)]
    Snapshot(#[from] keel_snapshot::SnapshotError),

    #[error(transparent)]
    History(#[from] keel_history::HistoryError),

    #[error(transparent)]
    Cache(#[from] keel_cache::CacheError),

    #[error("work item {work} failed")]
    Execution {
        work: String,
        #[source]
        source: anyhow::Error,
    },
}
