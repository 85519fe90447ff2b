/// Infrastructure failure of the queue or progress store.
///
/// Workers treat every `StoreError` as fatal: once the store cannot be
/// trusted, the one-owner-per-job guarantee cannot be kept either.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
