use thiserror::Error;

/// Errors produced by the blob storage engine.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// Unknown backend type or a configuration that failed validation.
    /// Raised before any state is mutated.
    #[error("invalid blob store configuration: {0}")]
    Configuration(String),

    /// A store with the same (case-insensitive) name already exists.
    #[error("blob store '{0}' already exists")]
    DuplicateStore(String),

    /// The store is still referenced and cannot be removed.
    #[error("blob store '{name}' is in use: {reason}")]
    InUse { name: String, reason: String },

    /// Maintenance refused because of an unfinished move or a competing task.
    #[error("{0}")]
    Conflict(String),

    #[error("blob store '{0}' not found")]
    NotFound(String),

    #[error("blob '{0}' not found")]
    BlobNotFound(String),

    /// Writes are rejected while the store is frozen.
    #[error("blob store '{0}' is frozen")]
    Frozen(String),

    /// The store is not started and cannot serve writes.
    #[error("blob store '{name}' is {state}")]
    NotStarted { name: String, state: String },

    #[error("invalid blob reference: {0}")]
    InvalidBlobRef(String),

    #[error("invalid blob headers: {0}")]
    InvalidHeaders(String),

    #[error("worker pool '{0}' queue is full")]
    PoolFull(String),

    #[error("worker pool '{0}' has shut down")]
    PoolClosed(String),

    /// The job panicked or was dropped before producing a result.
    #[error("job on worker pool '{0}' was aborted")]
    JobAborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure reported by an external collaborator (asset store, usage
    /// checker, move tracker, ...).
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl BlobStoreError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn in_use(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InUse {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;
