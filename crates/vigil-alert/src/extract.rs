//! Reads the scalar an alert compares against its threshold out of a
//! snapshot.

use std::collections::BTreeMap;
use vigil_common::metric::MetricKind;
use vigil_common::types::{MetricSnapshot, ROOT_FILESYSTEM};

/// A value read from a snapshot together with its display unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extracted {
    pub value: f64,
    pub unit: &'static str,
}

/// Extracts the value for `kind` from one snapshot.
///
/// `filesystem` is the rule's scope and only matters for [`MetricKind::Disk`].
/// Returns `None` when the snapshot lacks the data, so the rule is skipped
/// rather than evaluated against zero.
///
/// # Examples
///
/// ```
/// use vigil_alert::extract::extract;
/// use vigil_common::metric::MetricKind;
/// use vigil_common::types::MetricSnapshot;
///
/// let snapshot = MetricSnapshot { cpu: Some(42.5), ..Default::default() };
/// assert_eq!(extract(MetricKind::Cpu, &snapshot, None).unwrap().value, 42.5);
/// assert!(extract(MetricKind::Memory, &snapshot, None).is_none());
/// ```
pub fn extract(
    kind: MetricKind,
    snapshot: &MetricSnapshot,
    filesystem: Option<&str>,
) -> Option<Extracted> {
    let value = match kind {
        MetricKind::Cpu => snapshot.cpu?,
        MetricKind::Memory => snapshot.mem_pct?,
        MetricKind::Disk => match filesystem {
            Some(fs) => snapshot.filesystem_pct(fs)?,
            None => max_value(&keyed_readings(kind, snapshot)?)?,
        },
        MetricKind::Bandwidth => match (snapshot.bandwidth_up, snapshot.bandwidth_down) {
            (None, None) => return None,
            (up, down) => up.unwrap_or(0.0) + down.unwrap_or(0.0),
        },
        MetricKind::BandwidthUp => snapshot.bandwidth_up?,
        MetricKind::BandwidthDown => snapshot.bandwidth_down?,
        MetricKind::Temperature => max_value(&keyed_readings(kind, snapshot)?)?,
        MetricKind::LoadAvg1 => snapshot.load_avg?[0],
        MetricKind::LoadAvg5 => snapshot.load_avg?[1],
        MetricKind::LoadAvg15 => snapshot.load_avg?[2],
        MetricKind::Swap => {
            let pct = snapshot.swap_pct?;
            // Zero usage and zero percent means no swap is configured.
            if pct == 0.0 && snapshot.swap_used.unwrap_or(0.0) == 0.0 {
                return None;
            }
            pct
        }
    };
    Some(Extracted {
        value,
        unit: kind.unit(),
    })
}

/// Per-filesystem (Disk) or per-sensor (Temperature) readings.
///
/// Returns `None` for other kinds and when the snapshot carries no entry.
pub fn keyed_readings(kind: MetricKind, snapshot: &MetricSnapshot) -> Option<BTreeMap<String, f64>> {
    let readings: BTreeMap<String, f64> = match kind {
        MetricKind::Disk => snapshot
            .root_disk_pct()
            .map(|pct| (ROOT_FILESYSTEM.to_string(), pct))
            .into_iter()
            .chain(
                snapshot
                    .extra_fs
                    .iter()
                    .filter_map(|(name, usage)| Some((name.clone(), usage.used_pct()?))),
            )
            .collect(),
        MetricKind::Temperature => snapshot.temperatures.clone(),
        _ => return None,
    };
    (!readings.is_empty()).then_some(readings)
}

/// Entry with the highest value; ties resolve to the first key.
pub fn max_entry(readings: &BTreeMap<String, f64>) -> Option<(&str, f64)> {
    let mut best: Option<(&str, f64)> = None;
    for (key, &value) in readings {
        if best.is_none_or(|(_, v)| value > v) {
            best = Some((key.as_str(), value));
        }
    }
    best
}

fn max_value(readings: &BTreeMap<String, f64>) -> Option<f64> {
    max_entry(readings).map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::types::FsUsage;

    fn disk_snapshot() -> MetricSnapshot {
        let mut snapshot = MetricSnapshot {
            disk_used: Some(40.0),
            disk_total: Some(100.0),
            ..Default::default()
        };
        snapshot.extra_fs.insert(
            "data".into(),
            FsUsage {
                disk_used: 90.0,
                disk_total: 100.0,
            },
        );
        snapshot
    }

    #[test]
    fn test_disk_scoped_and_legacy() {
        let snapshot = disk_snapshot();
        assert_eq!(
            extract(MetricKind::Disk, &snapshot, Some("root")).unwrap().value,
            40.0
        );
        assert_eq!(
            extract(MetricKind::Disk, &snapshot, Some("data")).unwrap().value,
            90.0
        );
        assert!(extract(MetricKind::Disk, &snapshot, Some("missing")).is_none());
        // Un-scoped rules look at the fullest filesystem.
        assert_eq!(extract(MetricKind::Disk, &snapshot, None).unwrap().value, 90.0);
    }

    #[test]
    fn test_temperature_max_and_missing() {
        let mut snapshot = MetricSnapshot::default();
        assert!(extract(MetricKind::Temperature, &snapshot, None).is_none());

        snapshot.temperatures.insert("cpu".into(), 61.0);
        snapshot.temperatures.insert("nvme".into(), 48.0);
        let got = extract(MetricKind::Temperature, &snapshot, None).unwrap();
        assert_eq!(got.value, 61.0);
        assert_eq!(got.unit, "°C");
    }

    #[test]
    fn test_swap_not_configured_is_skipped() {
        let snapshot = MetricSnapshot {
            swap_pct: Some(0.0),
            swap_used: Some(0.0),
            ..Default::default()
        };
        assert!(extract(MetricKind::Swap, &snapshot, None).is_none());

        let snapshot = MetricSnapshot {
            swap_pct: Some(12.0),
            swap_used: Some(512.0),
            ..Default::default()
        };
        assert_eq!(extract(MetricKind::Swap, &snapshot, None).unwrap().value, 12.0);
    }

    #[test]
    fn test_bandwidth_and_load() {
        let snapshot = MetricSnapshot {
            bandwidth_up: Some(1.5),
            bandwidth_down: Some(2.0),
            load_avg: Some([0.5, 1.0, 2.0]),
            ..Default::default()
        };
        assert_eq!(extract(MetricKind::Bandwidth, &snapshot, None).unwrap().value, 3.5);
        assert_eq!(extract(MetricKind::BandwidthDown, &snapshot, None).unwrap().value, 2.0);
        assert_eq!(extract(MetricKind::LoadAvg15, &snapshot, None).unwrap().value, 2.0);
        assert!(extract(MetricKind::Cpu, &snapshot, None).is_none());
    }

    #[test]
    fn test_max_entry_prefers_first_on_tie() {
        let readings: BTreeMap<String, f64> =
            [("a".to_string(), 5.0), ("b".to_string(), 5.0)].into();
        assert_eq!(max_entry(&readings), Some(("a", 5.0)));
    }
}
