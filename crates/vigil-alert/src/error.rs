/// Errors raised by the alert engine.
///
/// Store failures arrive as `anyhow::Error` from the storage traits and are
/// wrapped in [`AlertError::Store`].
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert: unknown alert name '{0}'")]
    UnknownAlertName(String),

    #[error("Alert: system {0} not found")]
    SystemNotFound(String),

    /// The status debounce worker has shut down.
    #[error("Alert: status worker is not running")]
    WorkerStopped,

    #[error("Alert: store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AlertError>;
