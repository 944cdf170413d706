/// Errors that can occur within the notification subsystem.
///
/// Channel implementations return `anyhow::Result` at the trait boundary and
/// wrap these variants, so the dispatcher can log a precise reason per
/// recipient.
///
/// # Examples
///
/// ```rust
/// use vigil_notify::error::NotifyError;
///
/// let err = NotifyError::UnsupportedScheme("carrierpigeon".to_string());
/// assert!(err.to_string().contains("carrierpigeon"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The delivery URL could not be parsed.
    #[error("Notify: invalid delivery URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The delivery URL is well-formed but its scheme has no transport.
    #[error("Notify: unsupported delivery scheme '{0}'")]
    UnsupportedScheme(String),

    /// The delivery URL lacks a part the scheme needs (host, topic, ...).
    #[error("Notify: delivery URL is missing {0}")]
    IncompleteUrl(&'static str),

    /// An HTTP request to an external notification endpoint failed.
    #[error("Notify: HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The external endpoint answered with a non-success status.
    #[error("Notify: API error from {service}: status={status}, body={body}")]
    ApiError {
        service: String,
        status: u16,
        body: String,
    },

    /// Building or sending an e-mail failed.
    #[error("Notify: SMTP error: {0}")]
    SmtpError(String),

    /// JSON serialization failed.
    #[error("Notify: JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
