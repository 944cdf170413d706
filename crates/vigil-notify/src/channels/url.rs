//! Delivery through user-supplied channel URLs such as
//! `ntfy://ntfy.sh/alerts` or `generic://hooks.example.com/x?template=json`.
//!
//! Services differ in where they expect a title and a link, so the
//! notification is first shaped per scheme by [`format_for_url`] and then
//! handed to a [`UrlTransport`].

use crate::error::{NotifyError, Result};
use crate::utils::redact_url;
use crate::{NotificationChannel, RecipientResult};
use async_trait::async_trait;
use url::Url;
use vigil_common::types::Notification;

/// Schemes that take the title as a `title` query parameter.
const TITLE_PARAM_SCHEMES: &[&str] = &[
    "bark",
    "discord",
    "gotify",
    "ifttt",
    "join",
    "lark",
    "matrix",
    "ntfy",
    "opsgenie",
    "pushbullet",
    "pushover",
    "slack",
    "teams",
    "telegram",
    "zulip",
];

/// A notification shaped for one delivery URL.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedMessage {
    /// The delivery URL with title/link query parameters added.
    pub url: Url,
    pub message: String,
}

/// Applies the per-scheme title and link conventions to a notification.
///
/// # Examples
///
/// ```
/// use vigil_common::types::Notification;
/// use vigil_notify::channels::url::format_for_url;
///
/// let n = Notification {
///     user_id: "u1".into(),
///     title: "web-01 CPU above threshold".into(),
///     message: "CPU averaged 91.00% for the previous 5 minutes.".into(),
///     link: "https://vigil.example.com/system/web-01".into(),
///     link_text: "View web-01".into(),
/// };
/// let shaped = format_for_url("ntfy://ntfy.sh/alerts", &n).unwrap();
/// assert!(shaped.url.query().unwrap().contains("title="));
/// assert_eq!(shaped.message, n.message);
/// ```
pub fn format_for_url(raw: &str, notification: &Notification) -> Result<FormattedMessage> {
    let mut url = Url::parse(raw)?;
    let scheme = url.scheme().to_string();
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let param = |params: &[(String, String)], key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    let mut message = notification.message.clone();

    if TITLE_PARAM_SCHEMES.contains(&scheme.as_str()) {
        params.push(("title".into(), notification.title.clone()));
    } else if scheme == "mattermost" {
        message = format!("##### {}\n\n{}", notification.title, message);
    } else if scheme == "generic" && param(&params, "template").is_some() {
        let title_key = param(&params, "titlekey")
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "title".to_string());
        params.push((format!("${title_key}"), notification.title.clone()));
    } else {
        message = format!("{}\n\n{}", notification.title, message);
    }

    if scheme == "ntfy" {
        params.push((
            "Actions".into(),
            format!("view, {}, {}", notification.link_text, notification.link),
        ));
    } else {
        message = format!("{}\n\n{}", message, notification.link);
    }

    if params.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(params.iter());
    }

    Ok(FormattedMessage { url, message })
}

/// Performs the network delivery of an already formatted message.
#[async_trait]
pub trait UrlTransport: Send + Sync {
    async fn deliver(&self, message: &FormattedMessage) -> Result<()>;
}

/// Channel over every delivery URL configured for a user.
pub struct UrlChannel {
    transport: Box<dyn UrlTransport>,
}

impl UrlChannel {
    pub fn new(transport: Box<dyn UrlTransport>) -> Self {
        Self { transport }
    }

    /// Formats and delivers to a single URL, returning the failure reason.
    pub async fn send_one(&self, notification: &Notification, raw_url: &str) -> Result<()> {
        let formatted = format_for_url(raw_url, notification)?;
        self.transport.deliver(&formatted).await
    }
}

#[async_trait]
impl NotificationChannel for UrlChannel {
    async fn send(
        &self,
        notification: &Notification,
        recipients: &[String],
    ) -> anyhow::Result<Vec<RecipientResult>> {
        let mut results = Vec::with_capacity(recipients.len());
        for raw_url in recipients {
            match self.send_one(notification, raw_url).await {
                Ok(()) => {
                    tracing::debug!(url = %redact_url(raw_url), "Notification delivered");
                    results.push(RecipientResult::success(raw_url));
                }
                Err(e) => {
                    results.push(RecipientResult::failed(raw_url, &e));
                    if matches!(e, NotifyError::UnsupportedScheme(_)) {
                        tracing::warn!(url = %redact_url(raw_url), error = %e, "No transport for delivery URL");
                    }
                }
            }
        }
        Ok(results)
    }

    fn channel_type(&self) -> &str {
        "url"
    }
}
