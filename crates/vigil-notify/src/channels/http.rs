use super::url::{FormattedMessage, UrlTransport};
use crate::error::{NotifyError, Result};
use crate::utils::{redact_url, truncate_string, MAX_BODY_LENGTH};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// A fully resolved HTTP request for one delivery URL.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpRequest {
    pub target: String,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RequestBody {
    Text(String),
    Json(serde_json::Value),
}

/// [`UrlTransport`] that speaks HTTP for the `generic`, `ntfy`, `http` and
/// `https` schemes. Each delivery is a single POST; failures are returned
/// to the caller and never retried here.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn post(&self, request: &HttpRequest) -> Result<()> {
        let builder = self.client.post(request.target.as_str());
        let builder = match &request.body {
            RequestBody::Text(text) => builder
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(text.clone()),
            RequestBody::Json(value) => builder.json(value),
        };

        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = match resp.text().await {
            Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
            Err(e) => format!("[Failed to read response body: {e}]"),
        };
        Err(NotifyError::ApiError {
            service: redact_url(&request.target),
            status: status.as_u16(),
            body,
        })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UrlTransport for HttpTransport {
    async fn deliver(&self, message: &FormattedMessage) -> Result<()> {
        let request = build_request(message)?;
        self.post(&request).await
    }
}

/// Translates a formatted message into the HTTP request its scheme needs.
pub(crate) fn build_request(message: &FormattedMessage) -> Result<HttpRequest> {
    let url = &message.url;
    match url.scheme() {
        "generic" | "generic+https" | "generic+http" => generic_request(url, &message.message),
        "ntfy" => ntfy_request(url, &message.message),
        "http" | "https" => Ok(HttpRequest {
            target: url.to_string(),
            body: RequestBody::Text(message.message.clone()),
        }),
        other => Err(NotifyError::UnsupportedScheme(other.to_string())),
    }
}

fn generic_request(url: &Url, message: &str) -> Result<HttpRequest> {
    let host = url.host_str().ok_or(NotifyError::IncompleteUrl("a host"))?;
    let http_scheme = match url.scheme() {
        "generic+http" => "http",
        "generic+https" => "https",
        _ if query_value(url, "disabletls").is_some_and(|v| v == "yes" || v == "true") => "http",
        _ => "https",
    };

    let mut target = Url::parse(&format!("{http_scheme}://{host}"))?;
    let _ = target.set_port(url.port());
    target.set_path(url.path());

    let mut props = serde_json::Map::new();
    let mut passthrough = Vec::new();
    for (key, value) in url.query_pairs() {
        if let Some(prop) = key.strip_prefix('$') {
            props.insert(prop.to_string(), serde_json::Value::String(value.into_owned()));
        } else if !matches!(
            key.as_ref(),
            "template" | "titlekey" | "messagekey" | "disabletls"
        ) {
            passthrough.push((key.into_owned(), value.into_owned()));
        }
    }
    if !passthrough.is_empty() {
        target.query_pairs_mut().extend_pairs(passthrough.iter());
    }

    let body = if query_value(url, "template").as_deref() == Some("json") {
        let message_key = query_value(url, "messagekey")
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "message".to_string());
        props.insert(message_key, serde_json::Value::String(message.to_string()));
        RequestBody::Json(serde_json::Value::Object(props))
    } else {
        RequestBody::Text(message.to_string())
    };

    Ok(HttpRequest {
        target: target.to_string(),
        body,
    })
}

fn ntfy_request(url: &Url, message: &str) -> Result<HttpRequest> {
    let host = url.host_str().ok_or(NotifyError::IncompleteUrl("a host"))?;
    let topic = url.path().trim_matches('/');
    if topic.is_empty() {
        return Err(NotifyError::IncompleteUrl("a topic"));
    }
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    // Publish options go in the query string, not headers.
    let mut target = Url::parse(&format!("https://{authority}/{topic}"))?;
    let options: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, value)| {
            let key = match key.as_ref() {
                "title" => "title",
                "Actions" | "actions" => "actions",
                "priority" => "priority",
                "tags" => "tags",
                _ => return None,
            };
            Some((key.to_string(), value.into_owned()))
        })
        .collect();
    if !options.is_empty() {
        target.query_pairs_mut().extend_pairs(options.iter());
    }

    Ok(HttpRequest {
        target: target.to_string(),
        body: RequestBody::Text(message.to_string()),
    })
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
