//! Core domain model for geohaz hazard feeds.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Data domain a feed belongs to. Each domain runs its own polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Fire,
    Earthquake,
    Hazard,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Fire, Domain::Earthquake, Domain::Hazard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Fire => "fire",
            Domain::Earthquake => "earthquake",
            Domain::Hazard => "hazard",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fire" | "fires" => Ok(Domain::Fire),
            "earthquake" | "earthquakes" => Ok(Domain::Earthquake),
            "hazard" | "hazards" => Ok(Domain::Hazard),
            other => Err(format!("unknown domain `{other}`")),
        }
    }
}

/// How parsed records are reconciled with what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Delete every row of the table, then insert the new payload, in one transaction.
    ReplaceAll,
    /// Insert each record; natural-key conflicts are skipped silently.
    InsertIfAbsent,
    /// Insert each record; key conflicts overwrite every mutable column.
    UpsertReplace,
}

impl WritePolicy {
    pub fn default_for(domain: Domain) -> Self {
        match domain {
            Domain::Fire => WritePolicy::ReplaceAll,
            Domain::Earthquake => WritePolicy::InsertIfAbsent,
            Domain::Hazard => WritePolicy::UpsertReplace,
        }
    }

    /// Replace-all tables must stay consistent with one payload, so a bad row
    /// aborts the batch. Everything else can drop the offending record.
    pub fn default_record_error_policy(&self) -> RecordErrorPolicy {
        match self {
            WritePolicy::ReplaceAll => RecordErrorPolicy::AbortBatch,
            WritePolicy::InsertIfAbsent | WritePolicy::UpsertReplace => {
                RecordErrorPolicy::SkipRecord
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WritePolicy::ReplaceAll => "replace_all",
            WritePolicy::InsertIfAbsent => "insert_if_absent",
            WritePolicy::UpsertReplace => "upsert_replace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorPolicy {
    AbortBatch,
    SkipRecord,
}

/// One satellite hotspot observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireDetection {
    pub latitude: f64,
    pub longitude: f64,
    pub bright_ti4: Option<f64>,
    pub scan: Option<f64>,
    pub track: Option<f64>,
    pub acq_date: NaiveDate,
    /// Acquisition time as delivered by FIRMS: `HHMM` in UTC.
    pub acq_time: i32,
    pub satellite: String,
    pub instrument: Option<String>,
    pub confidence: Option<String>,
    pub version: Option<String>,
    pub bright_ti5: Option<f64>,
    pub frp: Option<f64>,
    pub daynight: Option<String>,
}

impl FireDetection {
    /// Satellite + acquisition date/time + location, matching the table's uniqueness constraint.
    pub fn natural_key(&self) -> String {
        format!(
            "{}|{}|{:04}|{}|{}",
            self.satellite, self.acq_date, self.acq_time, self.latitude, self.longitude
        )
    }

    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        let hours = (self.acq_time / 100) as u32;
        let minutes = (self.acq_time % 100) as u32;
        let time = NaiveTime::from_hms_opt(hours, minutes, 0)?;
        Some(Utc.from_utc_datetime(&self.acq_date.and_time(time)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarthquakeEvent {
    /// External id assigned by the feed; never rewritten once stored.
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub depth: Option<f64>,
    pub mag: Option<f64>,
    pub mag_type: Option<String>,
    pub sig: Option<i32>,
    pub tsunami: i32,
    pub place: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeverityData {
    pub severity: Option<f64>,
    pub severity_text: Option<String>,
    pub severity_unit: Option<String>,
}

/// Non-seismic, non-wildfire disaster alert (floods, cyclones, droughts, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardAlert {
    pub event_id: i64,
    pub event_type: String,
    pub description: Option<String>,
    pub alert_score: Option<f64>,
    pub country: Option<String>,
    pub affected_countries: Vec<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub date_modified: DateTime<Utc>,
    pub severity: SeverityData,
    pub is_current: bool,
    pub geometry_url: Option<String>,
    pub report_url: Option<String>,
}

impl HazardAlert {
    pub fn affected_countries_joined(&self) -> String {
        self.affected_countries.join(", ")
    }
}

/// Typed output of normalizing one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBatch {
    Fires(Vec<FireDetection>),
    Earthquakes(Vec<EarthquakeEvent>),
    Hazards(Vec<HazardAlert>),
}

impl RecordBatch {
    pub fn domain(&self) -> Domain {
        match self {
            RecordBatch::Fires(_) => Domain::Fire,
            RecordBatch::Earthquakes(_) => Domain::Earthquake,
            RecordBatch::Hazards(_) => Domain::Hazard,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Fires(rows) => rows.len(),
            RecordBatch::Earthquakes(rows) => rows.len(),
            RecordBatch::Hazards(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest observation in the batch: acquisition time for fires, origin
    /// time for earthquakes, last revision for hazard alerts.
    pub fn latest_observed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RecordBatch::Fires(rows) => rows.iter().filter_map(FireDetection::acquired_at).max(),
            RecordBatch::Earthquakes(rows) => rows.iter().map(|e| e.time).max(),
            RecordBatch::Hazards(rows) => rows.iter().map(|h| h.date_modified).max(),
        }
    }
}

pub fn datetime_from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}
