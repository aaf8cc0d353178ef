use std::collections::HashMap;
use wrench_core::settings::MaintenanceSettings;

/// Built-in service intervals in days. Configuration entries override these.
const BUILTIN_INTERVALS: &[(&str, i64)] = &[
    ("oil change", 90),
    ("interim service", 180),
    ("full service", 365),
    ("major service", 730),
    ("mot", 365),
    ("brake inspection", 180),
    ("brake pads", 365),
    ("tyre rotation", 180),
    ("wheel alignment", 365),
    ("air conditioning", 730),
    ("battery check", 365),
    ("coolant flush", 730),
    ("timing belt", 1825),
];

/// Maps a service label to how often it should be repeated.
#[derive(Debug, Clone)]
pub struct IntervalTable {
    intervals: HashMap<String, i64>,
    default_days: i64,
}

impl IntervalTable {
    pub fn new(default_days: i64) -> Self {
        Self {
            intervals: HashMap::new(),
            default_days,
        }
    }

    pub fn from_settings(settings: &MaintenanceSettings) -> Self {
        let mut table = Self::new(settings.default_interval_days);
        for (label, days) in BUILTIN_INTERVALS {
            table.insert(label, *days);
        }
        for (label, days) in &settings.intervals {
            table.insert(label, *days);
        }
        table
    }

    pub fn insert(&mut self, label: &str, days: i64) {
        self.intervals.insert(normalize_label(label), days);
    }

    /// Interval for `label`, falling back to the default when unmapped
    pub fn interval_days(&self, label: &str) -> i64 {
        self.intervals
            .get(&normalize_label(label))
            .copied()
            .unwrap_or(self.default_days)
    }
}

/// `"Oil-Change "` and `"oil change"` are the same service
pub fn normalize_label(label: &str) -> String {
    label
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
