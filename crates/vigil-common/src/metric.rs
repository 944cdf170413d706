//! The closed set of alertable metrics.
//!
//! Alert rules store their metric as a plain name (`"CPU"`, `"LoadAvg5"`, ...).
//! Names are resolved once through [`AlertKind::from_name`], which is backed
//! by a table built on first use, so the rest of the engine works with the
//! enum instead of matching on strings.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Every metric a threshold rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    /// Upload plus download, kept for rules created before the split.
    Bandwidth,
    BandwidthUp,
    BandwidthDown,
    Temperature,
    LoadAvg1,
    LoadAvg5,
    LoadAvg15,
    Swap,
}

/// How the window aggregator combines a metric's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    /// One series, arithmetic mean.
    Mean,
    /// One series per filesystem, each averaged independently.
    PerFilesystem,
    /// One series per sensor, the highest mean wins.
    PerSensor,
}

/// An alert rule is either a threshold rule over a metric or a binary
/// up/down connectivity rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Metric(MetricKind),
    Status,
}

/// Stored name of the connectivity rule.
pub const STATUS_ALERT_NAME: &str = "Status";

static KINDS: LazyLock<HashMap<&'static str, AlertKind>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for kind in MetricKind::ALL {
        map.insert(kind.name(), AlertKind::Metric(kind));
    }
    map.insert(STATUS_ALERT_NAME, AlertKind::Status);
    map
});

impl AlertKind {
    /// Resolves a stored rule name. Unknown names yield `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_common::metric::{AlertKind, MetricKind};
    ///
    /// assert_eq!(AlertKind::from_name("CPU"), Some(AlertKind::Metric(MetricKind::Cpu)));
    /// assert_eq!(AlertKind::from_name("Status"), Some(AlertKind::Status));
    /// assert_eq!(AlertKind::from_name("cpu"), None);
    /// ```
    pub fn from_name(name: &str) -> Option<Self> {
        KINDS.get(name).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlertKind::Metric(kind) => kind.name(),
            AlertKind::Status => STATUS_ALERT_NAME,
        }
    }
}

impl MetricKind {
    pub const ALL: [MetricKind; 11] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Disk,
        MetricKind::Bandwidth,
        MetricKind::BandwidthUp,
        MetricKind::BandwidthDown,
        MetricKind::Temperature,
        MetricKind::LoadAvg1,
        MetricKind::LoadAvg5,
        MetricKind::LoadAvg15,
        MetricKind::Swap,
    ];

    /// Name as stored on alert rules.
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "CPU",
            MetricKind::Memory => "Memory",
            MetricKind::Disk => "Disk",
            MetricKind::Bandwidth => "Bandwidth",
            MetricKind::BandwidthUp => "BandwidthUp",
            MetricKind::BandwidthDown => "BandwidthDown",
            MetricKind::Temperature => "Temperature",
            MetricKind::LoadAvg1 => "LoadAvg1",
            MetricKind::LoadAvg5 => "LoadAvg5",
            MetricKind::LoadAvg15 => "LoadAvg15",
            MetricKind::Swap => "Swap",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::Cpu | MetricKind::Memory | MetricKind::Disk | MetricKind::Swap => "%",
            MetricKind::Bandwidth | MetricKind::BandwidthUp | MetricKind::BandwidthDown => " MB/s",
            MetricKind::Temperature => "°C",
            MetricKind::LoadAvg1 | MetricKind::LoadAvg5 | MetricKind::LoadAvg15 => "",
        }
    }

    /// Name used inside notification titles, e.g. `"web-01 memory above threshold"`.
    pub fn display_name(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "CPU",
            MetricKind::Memory => "memory",
            MetricKind::Disk => "disk",
            MetricKind::Bandwidth => "network",
            MetricKind::BandwidthUp => "upload",
            MetricKind::BandwidthDown => "download",
            MetricKind::Temperature => "temperature",
            MetricKind::LoadAvg1 => "1m load",
            MetricKind::LoadAvg5 => "5m load",
            MetricKind::LoadAvg15 => "15m load",
            MetricKind::Swap => "swap",
        }
    }

    /// Combination rule for windowed evaluation. `scoped` is true when the
    /// rule names a specific filesystem.
    pub fn combine(&self, scoped: bool) -> Combine {
        match self {
            MetricKind::Disk if !scoped => Combine::PerFilesystem,
            MetricKind::Temperature => Combine::PerSensor,
            _ => Combine::Mean,
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
