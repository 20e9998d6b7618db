//! Hazard alert revision reduction.

use std::collections::BTreeMap;

use geohaz_core::HazardAlert;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub received: usize,
    pub superseded: usize,
    pub not_current: usize,
    pub excluded: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupResult {
    pub kept: Vec<HazardAlert>,
    pub stats: DedupStats,
}

/// Collapses the revisions a GDACS feed returns for one event into the newest
/// one, then drops events that are no longer current or that belong to
/// another pipeline (earthquakes and wildfires by default).
#[derive(Debug, Clone)]
pub struct HazardDeduplicator {
    excluded_types: Vec<String>,
}

impl Default for HazardDeduplicator {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_EXCLUDED_HAZARD_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        )
    }
}

impl HazardDeduplicator {
    pub fn new(excluded_types: Vec<String>) -> Self {
        Self {
            excluded_types: excluded_types
                .into_iter()
                .map(|t| t.trim().to_ascii_uppercase())
                .collect(),
        }
    }

    pub fn is_excluded(&self, event_type: &str) -> bool {
        self.excluded_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(event_type.trim()))
    }

    /// Newest `date_modified` per event id. Equal timestamps resolve to the
    /// record seen later in the feed.
    pub fn reduce(&self, records: Vec<HazardAlert>) -> BTreeMap<i64, HazardAlert> {
        let mut latest: BTreeMap<i64, HazardAlert> = BTreeMap::new();
        for record in records {
            let newer = latest
                .get(&record.event_id)
                .map_or(true, |current| record.date_modified >= current.date_modified);
            if newer {
                latest.insert(record.event_id, record);
            }
        }
        latest
    }

    /// The current-flag filter runs on the surviving revision, so an event
    /// whose newest revision is closed is dropped rather than falling back to
    /// an older, still-open one.
    pub fn apply(&self, records: Vec<HazardAlert>) -> DedupResult {
        let received = records.len();
        let latest = self.reduce(records);
        let mut stats = DedupStats {
            received,
            superseded: received - latest.len(),
            ..DedupStats::default()
        };

        let mut kept = Vec::with_capacity(latest.len());
        for alert in latest.into_values() {
            if !alert.is_current {
                stats.not_current += 1;
            } else if self.is_excluded(&alert.event_type) {
                stats.excluded += 1;
            } else {
                kept.push(alert);
            }
        }
        DedupResult { kept, stats }
    }
}
