use crate::error::NotifyError;
use crate::{NotificationChannel, RecipientResult};
use anyhow::Result;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use vigil_common::types::Notification;

/// SMTP relay settings, read from the `[smtp]` table of the server config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

/// Sends one message per notification, addressed to every recipient.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?.port(settings.port);

        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: settings.from.parse()?,
        })
    }

    /// Builds the message; addresses that fail to parse are returned
    /// separately so they can be reported without blocking the rest.
    pub fn build_message(
        &self,
        notification: &Notification,
        recipients: &[String],
    ) -> Result<(Option<Message>, Vec<RecipientResult>)> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.title.as_str())
            .header(ContentType::TEXT_PLAIN);

        let mut rejected = Vec::new();
        let mut accepted = 0usize;
        for recipient in recipients {
            match recipient.parse::<Mailbox>() {
                Ok(mailbox) => {
                    builder = builder.to(mailbox);
                    accepted += 1;
                }
                Err(e) => rejected.push(RecipientResult::failed(recipient, e)),
            }
        }

        if accepted == 0 {
            return Ok((None, rejected));
        }

        let body = format!("{}\n\n{}", notification.message, notification.link);
        let message = builder
            .body(body)
            .map_err(|e| NotifyError::SmtpError(e.to_string()))?;
        Ok((Some(message), rejected))
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(
        &self,
        notification: &Notification,
        recipients: &[String],
    ) -> Result<Vec<RecipientResult>> {
        if recipients.is_empty() {
            return Ok(Vec::new());
        }

        let (message, mut results) = self.build_message(notification, recipients)?;
        let Some(message) = message else {
            return Ok(results);
        };

        let valid: Vec<&String> = recipients
            .iter()
            .filter(|r| !results.iter().any(|res| &res.recipient == *r))
            .collect();
        match self.transport.send(message).await {
            Ok(_) => {
                results.extend(valid.iter().map(|r| RecipientResult::success(r)));
            }
            Err(e) => {
                let err = NotifyError::SmtpError(e.to_string());
                results.extend(valid.iter().map(|r| RecipientResult::failed(r, &err)));
            }
        }
        Ok(results)
    }

    fn channel_type(&self) -> &str {
        "email"
    }
}
