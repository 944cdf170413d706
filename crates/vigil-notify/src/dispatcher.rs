use crate::channels::url::UrlChannel;
use crate::utils::redact_url;
use crate::{NotificationChannel, RecipientResult};
use anyhow::Result;
use std::sync::Arc;
use vigil_common::types::Notification;
use vigil_storage::UserSettingsStore;

/// Resolves a user's channels and delivers a notification to all of them.
pub struct Dispatcher {
    settings: Arc<dyn UserSettingsStore>,
    urls: UrlChannel,
    email: Option<Box<dyn NotificationChannel>>,
    app_url: String,
}

impl Dispatcher {
    pub fn new(
        settings: Arc<dyn UserSettingsStore>,
        urls: UrlChannel,
        email: Option<Box<dyn NotificationChannel>>,
        app_url: &str,
    ) -> Self {
        Self {
            settings,
            urls,
            email,
            app_url: app_url.trim_end_matches('/').to_string(),
        }
    }

    /// Delivers `notification` to the user's e-mail addresses and delivery
    /// URLs concurrently.
    ///
    /// Per-recipient failures are logged and do not fail the call; only a
    /// settings lookup failure is returned.
    pub async fn send(&self, notification: &Notification) -> Result<()> {
        let Some(settings) = self.settings.get_user_settings(&notification.user_id)? else {
            tracing::debug!(user_id = %notification.user_id, "No notification settings, skipping");
            return Ok(());
        };

        let mail = async {
            if settings.emails.is_empty() {
                return;
            }
            let Some(email) = &self.email else {
                tracing::warn!(
                    user_id = %notification.user_id,
                    "SMTP is not configured, skipping e-mail delivery"
                );
                return;
            };
            match email.send(notification, &settings.emails).await {
                Ok(results) => log_results(email.channel_type(), &results),
                Err(e) => tracing::error!(
                    channel = email.channel_type(),
                    user_id = %notification.user_id,
                    error = %e,
                    "Failed to send notification"
                ),
            }
        };

        let hooks = async {
            if settings.webhooks.is_empty() {
                return;
            }
            match self.urls.send(notification, &settings.webhooks).await {
                Ok(results) => log_results(self.urls.channel_type(), &results),
                Err(e) => tracing::error!(
                    channel = self.urls.channel_type(),
                    user_id = %notification.user_id,
                    error = %e,
                    "Failed to send notification"
                ),
            }
        };

        tokio::join!(mail, hooks);
        Ok(())
    }

    /// Sends a fixed test notification to a single delivery URL and returns
    /// the delivery error, if any.
    pub async fn send_test(&self, url: &str) -> Result<()> {
        let notification = Notification {
            user_id: String::new(),
            title: "Test Alert".to_string(),
            message: "This is a test notification from Vigil.".to_string(),
            link: self.app_url.clone(),
            link_text: "View Vigil".to_string(),
        };
        self.urls.send_one(&notification, url).await?;
        Ok(())
    }
}

fn log_results(channel: &str, results: &[RecipientResult]) {
    for result in results {
        let recipient = if channel == "url" {
            redact_url(&result.recipient)
        } else {
            result.recipient.clone()
        };
        match &result.error {
            None => tracing::debug!(channel, recipient = %recipient, "Notification sent"),
            Some(error) => tracing::error!(
                channel,
                recipient = %recipient,
                error = %error,
                "Failed to deliver notification"
            ),
        }
    }
}
