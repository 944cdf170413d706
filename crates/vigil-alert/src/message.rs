//! Titles, bodies and links of alert notifications.

use vigil_common::metric::MetricKind;
use vigil_common::types::{AlertRule, Notification};

/// Where a notification points the user.
#[derive(Debug, Clone)]
pub struct SystemLink {
    pub url: String,
    pub text: String,
}

impl SystemLink {
    /// `{app_url}/system/{name}` with the name percent-encoded.
    pub fn new(app_url: &str, system_name: &str) -> Self {
        Self {
            url: format!(
                "{}/system/{}",
                app_url.trim_end_matches('/'),
                urlencoding::encode(system_name)
            ),
            text: format!("View {system_name}"),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Subject of a body line: `"CPU"`, `"Usage of /data"`, `"Highest sensor cpu"`.
pub fn descriptor(kind: MetricKind, key: Option<&str>) -> String {
    match (kind, key) {
        (MetricKind::Disk, Some(fs)) => format!("Usage of {fs}"),
        (MetricKind::Temperature, Some(sensor)) => format!("Highest sensor {sensor}"),
        _ => capitalize(kind.display_name()),
    }
}

fn minutes(n: u32) -> String {
    if n == 1 {
        "1 minute".to_string()
    } else {
        format!("{n} minutes")
    }
}

/// Notification for a metric rule crossing its threshold.
pub fn threshold_notification(
    rule: &AlertRule,
    kind: MetricKind,
    system_name: &str,
    key: Option<&str>,
    value: f64,
    triggered: bool,
    link: &SystemLink,
) -> Notification {
    let direction = if triggered { "above" } else { "below" };
    Notification {
        user_id: rule.user_id.clone(),
        title: format!(
            "{system_name} {} {direction} threshold",
            kind.display_name()
        ),
        message: format!(
            "{} averaged {value:.2}{} for the previous {}.",
            descriptor(kind, key.or(rule.filesystem.as_deref())),
            kind.unit(),
            minutes(rule.min_duration_minutes.max(1))
        ),
        link: link.url.clone(),
        link_text: link.text.clone(),
    }
}

/// Notification for a status rule going down or coming back up.
pub fn status_notification(rule: &AlertRule, system_name: &str, down: bool, link: &SystemLink) -> Notification {
    let (state, emoji) = if down { ("down", "🔴") } else { ("up", "✅") };
    let message = format!("Connection to {system_name} is {state}");
    Notification {
        user_id: rule.user_id.clone(),
        title: format!("{message} {emoji}"),
        message,
        link: link.url.clone(),
        link_text: link.text.clone(),
    }
}

fn repeat_suffix(rule: &AlertRule) -> String {
    if rule.max_repeats > 0 {
        format!("(repeat {} of {})", rule.repeat_count, rule.max_repeats)
    } else {
        format!("(repeat {})", rule.repeat_count)
    }
}

/// Reminder for a rule that is still triggered. `rule.repeat_count` must
/// already include this repeat. `kind` is `None` for status rules.
pub fn repeat_notification(
    rule: &AlertRule,
    kind: Option<MetricKind>,
    system_name: &str,
    link: &SystemLink,
) -> Notification {
    let (title, message) = match kind {
        Some(kind) => (
            format!("{system_name} {} still above threshold", kind.display_name()),
            format!(
                "{} remains above the threshold of {}{} {}",
                descriptor(kind, rule.filesystem.as_deref()),
                rule.threshold,
                kind.unit(),
                repeat_suffix(rule)
            ),
        ),
        None => (
            format!("Connection to {system_name} is still down 🔴"),
            format!(
                "Connection to {system_name} is still down {}",
                repeat_suffix(rule)
            ),
        ),
    };
    Notification {
        user_id: rule.user_id.clone(),
        title,
        message,
        link: link.url.clone(),
        link_text: link.text.clone(),
    }
}
