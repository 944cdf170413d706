//! Notification delivery for triggered, cleared and repeated alerts.
//!
//! A [`dispatcher::Dispatcher`] looks up a user's notification settings and
//! fans a [`Notification`] out to every configured channel: delivery URLs
//! through [`channels::url::UrlChannel`] and e-mail through
//! [`channels::email::EmailChannel`]. The alert engine never awaits a
//! delivery; it hands notifications to a [`NotificationSink`], normally the
//! bounded worker pool in [`queue`].

pub mod channels;
pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod utils;


use anyhow::Result;
use async_trait::async_trait;
use vigil_common::types::Notification;

/// Outcome of delivering to a single recipient (an address or a URL).
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientResult {
    pub recipient: String,
    /// `None` on success.
    pub error: Option<String>,
}

impl RecipientResult {
    pub fn success(recipient: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            error: None,
        }
    }

    pub fn failed(recipient: &str, error: impl std::fmt::Display) -> Self {
        Self {
            recipient: recipient.to_string(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A delivery channel that sends a rendered notification to a set of
/// recipients of one kind.
///
/// A failure for one recipient must not prevent delivery to the others;
/// it is reported in the returned [`RecipientResult`]s instead.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers `notification` to every recipient.
    ///
    /// # Errors
    ///
    /// Returns an error only when the channel itself cannot be used (for
    /// example the mail transport cannot be built).
    async fn send(
        &self,
        notification: &Notification,
        recipients: &[String],
    ) -> Result<Vec<RecipientResult>>;

    /// Channel type name, e.g. `"email"` or `"url"`.
    fn channel_type(&self) -> &str;
}

/// Fire-and-forget hand-off used by the alert engine.
///
/// Implementations must return promptly and never wait for delivery.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}
