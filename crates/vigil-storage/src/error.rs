/// Errors raised by bulk rule operations and by row decoding.
///
/// The store traits return `anyhow::Result`; this type is what callers can
/// downcast to when they need to tell an authorization failure apart from
/// a backend failure.
///
/// # Examples
///
/// ```rust
/// use vigil_storage::error::StorageError;
///
/// let err = StorageError::Forbidden {
///     user_id: "u1".to_string(),
///     system_id: "sys-9".to_string(),
/// };
/// assert!(err.to_string().contains("sys-9"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// The requesting user does not own a target system.
    #[error("Storage: user {user_id} may not manage alerts on system {system_id}")]
    Forbidden { user_id: String, system_id: String },

    /// The rule name is not a known metric.
    #[error("Storage: unknown alert name '{0}'")]
    UnknownAlertName(String),

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure (snapshot payloads,
    /// user settings lists).
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A column held a value that does not decode, e.g. an unknown status.
    #[error("Storage: invalid value in column '{column}': {value}")]
    InvalidColumn { column: &'static str, value: String },

    /// Failure reported by a store backend.
    #[error("Storage: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
