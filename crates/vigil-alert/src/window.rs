use crate::extract::{extract, keyed_readings, max_entry};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use vigil_common::metric::{Combine, MetricKind};
use vigil_common::types::{AlertRule, MetricSnapshot};

/// Slack applied to both window edges for collection jitter.
pub const TOLERANCE_SECS: i64 = 10;

/// A window of `n` minutes needs at least `n / 1.2` snapshots.
pub const MIN_COVERAGE_DIVISOR: f64 = 1.2;

/// The averaging window `[now - minutes, now]` of one rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AveragingWindow {
    minutes: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl AveragingWindow {
    pub fn ending_at(now: DateTime<Utc>, minutes: u32) -> Self {
        Self {
            minutes,
            start: now - Duration::minutes(i64::from(minutes)),
            end: now,
        }
    }

    /// Inclusive range to query, widened by the tolerance.
    pub fn query_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let slack = Duration::seconds(TOLERANCE_SECS);
        (self.start - slack, self.end + slack)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let (from, to) = self.query_range();
        ts >= from && ts <= to
    }

    pub fn has_coverage(&self, count: usize) -> bool {
        count as f64 >= f64::from(self.minutes) / MIN_COVERAGE_DIVISOR
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }
}

/// One representative value; `key` names the filesystem or sensor when the
/// value came from a keyed reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub key: Option<String>,
    pub value: f64,
}

/// Outcome of aggregating a window.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// One entry for plain means, one per filesystem for legacy disk rules,
    /// the hottest sensor for temperature.
    pub readings: Vec<Reading>,
    /// Snapshots in the window that carried the metric.
    pub coverage: usize,
}

impl Aggregate {
    /// The largest reading, which decides trigger and clear.
    pub fn peak(&self) -> Option<&Reading> {
        let mut best: Option<&Reading> = None;
        for reading in &self.readings {
            if best.is_none_or(|b| reading.value > b.value) {
                best = Some(reading);
            }
        }
        best
    }
}

/// Averages `snapshots` (oldest first) over the rule's window ending at `now`.
///
/// Snapshots outside the window or missing the metric are ignored and do
/// not count toward coverage.
pub fn aggregate(
    rule: &AlertRule,
    kind: MetricKind,
    snapshots: &[MetricSnapshot],
    now: DateTime<Utc>,
) -> Aggregate {
    let window = AveragingWindow::ending_at(now, rule.min_duration_minutes);
    let in_window = snapshots.iter().filter(|s| window.contains(s.created_at));

    match kind.combine(rule.filesystem.is_some()) {
        Combine::Mean => {
            let mut sum = 0.0;
            let mut count = 0usize;
            for snapshot in in_window {
                if let Some(e) = extract(kind, snapshot, rule.filesystem.as_deref()) {
                    sum += e.value;
                    count += 1;
                }
            }
            let readings = if count == 0 {
                Vec::new()
            } else {
                vec![Reading {
                    key: None,
                    value: sum / count as f64,
                }]
            };
            Aggregate {
                readings,
                coverage: count,
            }
        }
        combine @ (Combine::PerFilesystem | Combine::PerSensor) => {
            let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
            let mut count = 0usize;
            for snapshot in in_window {
                let Some(readings) = keyed_readings(kind, snapshot) else {
                    continue;
                };
                count += 1;
                for (key, value) in readings {
                    let entry = sums.entry(key).or_insert((0.0, 0));
                    entry.0 += value;
                    entry.1 += 1;
                }
            }
            let means: BTreeMap<String, f64> = sums
                .into_iter()
                .map(|(key, (sum, n))| (key, sum / n as f64))
                .collect();
            Aggregate {
                readings: keyed(combine, &means),
                coverage: count,
            }
        }
    }
}

/// Readings of a single snapshot, used when the window is one minute.
pub fn instant(rule: &AlertRule, kind: MetricKind, snapshot: &MetricSnapshot) -> Aggregate {
    let readings = match kind.combine(rule.filesystem.is_some()) {
        Combine::Mean => extract(kind, snapshot, rule.filesystem.as_deref())
            .map(|e| {
                vec![Reading {
                    key: None,
                    value: e.value,
                }]
            })
            .unwrap_or_default(),
        combine => keyed_readings(kind, snapshot)
            .map(|readings| keyed(combine, &readings))
            .unwrap_or_default(),
    };
    let coverage = usize::from(!readings.is_empty());
    Aggregate { readings, coverage }
}

fn keyed(combine: Combine, values: &BTreeMap<String, f64>) -> Vec<Reading> {
    match combine {
        Combine::PerSensor => max_entry(values)
            .map(|(key, value)| {
                vec![Reading {
                    key: Some(key.to_string()),
                    value,
                }]
            })
            .unwrap_or_default(),
        _ => values
            .iter()
            .map(|(key, &value)| Reading {
                key: Some(key.clone()),
                value,
            })
            .collect(),
    }
}
