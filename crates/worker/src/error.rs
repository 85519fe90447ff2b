use folio_core::error::CoreError;
use folio_db::StoreError;

/// Errors surfaced by the job service and the worker pool.
///
/// `Store` is fatal to a worker pool: it stops every slot and the process
/// is expected to exit and be restarted.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Worker slot {slot} aborted: {reason}")]
    SlotAborted { slot: String, reason: String },
}
