pub type Result<T> = std::result::Result<T, HistoryError>;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Cache(#[from] keel_cache::CacheError),

    #[error("snapshot {id} is missing from the snapshot repository")]
    MissingSnapshot { id: i64 },

    #[error("failed to encode property {name:?}: {source}")]
    Property {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}
