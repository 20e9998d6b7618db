//! Feed adapters: raw FIRMS CSV, USGS GeoJSON and GDACS JSON payloads into typed records.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use geohaz_core::{
    datetime_from_epoch_millis, Domain, EarthquakeEvent, FireDetection, HazardAlert,
    RecordBatch, RecordErrorPolicy, SeverityData,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Csv,
    GeoJson,
    Json,
}

/// A single row or feature that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record {index}: missing required field `{field}`")]
    Missing { index: usize, field: &'static str },
    #[error("record {index}: invalid `{field}` value `{value}`")]
    Invalid {
        index: usize,
        field: &'static str,
        value: String,
    },
    #[error("record {index}: {message}")]
    Malformed { index: usize, message: String },
}

impl RecordError {
    pub fn index(&self) -> usize {
        match self {
            RecordError::Missing { index, .. }
            | RecordError::Invalid { index, .. }
            | RecordError::Malformed { index, .. } => *index,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The payload as a whole is unusable (wrong format, missing header or feature list).
    #[error("payload is not a usable {format:?} document: {message}")]
    Payload {
        format: PayloadFormat,
        message: String,
    },
    /// A record failed under [`RecordErrorPolicy::AbortBatch`].
    #[error(transparent)]
    Record(#[from] RecordError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch {
    pub batch: RecordBatch,
    /// Records dropped under [`RecordErrorPolicy::SkipRecord`].
    pub skipped: Vec<RecordError>,
}

pub trait FeedAdapter: Send + Sync {
    fn domain(&self) -> Domain;
    fn format(&self) -> PayloadFormat;
    fn parse(&self, payload: &[u8], policy: RecordErrorPolicy) -> Result<ParsedBatch, AdapterError>;
}

pub fn adapter_for_domain(domain: Domain) -> Box<dyn FeedAdapter> {
    match domain {
        Domain::Fire => Box::new(FirmsCsvAdapter),
        Domain::Earthquake => Box::new(UsgsGeoJsonAdapter),
        Domain::Hazard => Box::new(GdacsEventAdapter),
    }
}

/// Convenience wrapper over [`adapter_for_domain`].
pub fn parse(
    domain: Domain,
    payload: &[u8],
    policy: RecordErrorPolicy,
) -> Result<ParsedBatch, AdapterError> {
    adapter_for_domain(domain).parse(payload, policy)
}

fn collect_records<T>(
    results: impl IntoIterator<Item = Result<T, RecordError>>,
    policy: RecordErrorPolicy,
) -> Result<(Vec<T>, Vec<RecordError>), AdapterError> {
    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for result in results {
        match result {
            Ok(record) => records.push(record),
            Err(err) => match policy {
                RecordErrorPolicy::AbortBatch => return Err(AdapterError::Record(err)),
                RecordErrorPolicy::SkipRecord => skipped.push(err),
            },
        }
    }
    Ok((records, skipped))
}

/// Parses the timestamp shapes seen in hazard feeds. Values without an
/// offset are UTC.
pub fn parse_feed_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

// ---------------------------------------------------------------------------
// FIRMS CSV

#[derive(Debug, Clone, Copy, Default)]
pub struct FirmsCsvAdapter;

/// Column positions resolved from the CSV header. MODIS feeds name the
/// brightness channels `brightness` / `bright_t31`.
#[derive(Debug, Clone, Copy)]
struct FirmsColumns {
    latitude: usize,
    longitude: usize,
    acq_date: usize,
    acq_time: usize,
    satellite: usize,
    bright_ti4: Option<usize>,
    scan: Option<usize>,
    track: Option<usize>,
    instrument: Option<usize>,
    confidence: Option<usize>,
    version: Option<usize>,
    bright_ti5: Option<usize>,
    frp: Option<usize>,
    daynight: Option<usize>,
}

impl FirmsColumns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, AdapterError> {
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
        };
        let require = |name: &'static str| {
            find(&[name]).ok_or_else(|| AdapterError::Payload {
                format: PayloadFormat::Csv,
                message: format!("missing column `{name}`"),
            })
        };
        Ok(Self {
            latitude: require("latitude")?,
            longitude: require("longitude")?,
            acq_date: require("acq_date")?,
            acq_time: require("acq_time")?,
            satellite: require("satellite")?,
            bright_ti4: find(&["bright_ti4", "brightness"]),
            scan: find(&["scan"]),
            track: find(&["track"]),
            instrument: find(&["instrument"]),
            confidence: find(&["confidence"]),
            version: find(&["version"]),
            bright_ti5: find(&["bright_ti5", "bright_t31"]),
            frp: find(&["frp"]),
            daynight: find(&["daynight"]),
        })
    }
}

struct CsvRow<'a> {
    index: usize,
    record: &'a csv::StringRecord,
}

impl CsvRow<'_> {
    fn text(&self, column: Option<usize>) -> Option<String> {
        column
            .and_then(|c| self.record.get(c))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn required_text(&self, column: usize, field: &'static str) -> Result<String, RecordError> {
        self.text(Some(column)).ok_or(RecordError::Missing {
            index: self.index,
            field,
        })
    }

    fn number(&self, column: Option<usize>, field: &'static str) -> Result<Option<f64>, RecordError> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .map(Some)
                .map_err(|_| RecordError::Invalid {
                    index: self.index,
                    field,
                    value: raw,
                }),
        }
    }

    fn coordinate(&self, column: usize, field: &'static str, bound: f64) -> Result<f64, RecordError> {
        let value = self.number(Some(column), field)?.ok_or(RecordError::Missing {
            index: self.index,
            field,
        })?;
        if value.abs() > bound {
            return Err(RecordError::Invalid {
                index: self.index,
                field,
                value: value.to_string(),
            });
        }
        Ok(value)
    }
}

/// `acq_time` arrives as `HHMM`, sometimes without the leading zeros.
fn parse_hhmm(raw: &str) -> Option<i32> {
    let value: i32 = raw.trim().parse().ok()?;
    if !(0..=2359).contains(&value) || value % 100 >= 60 {
        return None;
    }
    Some(value)
}

fn parse_fire_row(columns: &FirmsColumns, row: CsvRow<'_>) -> Result<FireDetection, RecordError> {
    let index = row.index;
    let raw_date = row.required_text(columns.acq_date, "acq_date")?;
    let acq_date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d").map_err(|_| {
        RecordError::Invalid {
            index,
            field: "acq_date",
            value: raw_date.clone(),
        }
    })?;
    let raw_time = row.required_text(columns.acq_time, "acq_time")?;
    let acq_time = parse_hhmm(&raw_time).ok_or(RecordError::Invalid {
        index,
        field: "acq_time",
        value: raw_time.clone(),
    })?;

    Ok(FireDetection {
        latitude: row.coordinate(columns.latitude, "latitude", 90.0)?,
        longitude: row.coordinate(columns.longitude, "longitude", 180.0)?,
        bright_ti4: row.number(columns.bright_ti4, "bright_ti4")?,
        scan: row.number(columns.scan, "scan")?,
        track: row.number(columns.track, "track")?,
        acq_date,
        acq_time,
        satellite: row.required_text(columns.satellite, "satellite")?,
        instrument: row.text(columns.instrument),
        confidence: row.text(columns.confidence),
        version: row.text(columns.version),
        bright_ti5: row.number(columns.bright_ti5, "bright_ti5")?,
        frp: row.number(columns.frp, "frp")?,
        daynight: row.text(columns.daynight),
    })
}

impl FeedAdapter for FirmsCsvAdapter {
    fn domain(&self) -> Domain {
        Domain::Fire
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Csv
    }

    fn parse(&self, payload: &[u8], policy: RecordErrorPolicy) -> Result<ParsedBatch, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(payload);
        let headers = reader.headers().map_err(|e| AdapterError::Payload {
            format: PayloadFormat::Csv,
            message: e.to_string(),
        })?;
        let columns = FirmsColumns::resolve(headers)?;

        let rows = reader.records().enumerate().map(|(index, record)| {
            let record = record.map_err(|e| RecordError::Malformed {
                index,
                message: e.to_string(),
            })?;
            parse_fire_row(&columns, CsvRow { index, record: &record })
        });
        let (fires, skipped) = collect_records(rows, policy)?;
        Ok(ParsedBatch {
            batch: RecordBatch::Fires(fires),
            skipped,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON helpers

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_path(value, path)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Numbers occasionally arrive quoted.
fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let v = json_path(value, path)?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_path(value, path)?;
    v.as_i64()
        .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    match json_path(value, path)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        JsonValue::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn feature_list(payload: &[u8], format: PayloadFormat) -> Result<Vec<JsonValue>, AdapterError> {
    let root: JsonValue = serde_json::from_slice(payload).map_err(|e| AdapterError::Payload {
        format,
        message: e.to_string(),
    })?;
    match root {
        JsonValue::Object(mut map) => match map.remove("features") {
            Some(JsonValue::Array(features)) => Ok(features),
            _ => Err(AdapterError::Payload {
                format,
                message: "missing `features` array".to_string(),
            }),
        },
        _ => Err(AdapterError::Payload {
            format,
            message: "top-level value is not an object".to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// USGS GeoJSON

#[derive(Debug, Clone, Copy, Default)]
pub struct UsgsGeoJsonAdapter;

/// GeoJSON positions are `[longitude, latitude, depth]`; records store latitude first.
fn parse_earthquake(index: usize, feature: &JsonValue) -> Result<EarthquakeEvent, RecordError> {
    let id = json_str(feature, &["id"]).ok_or(RecordError::Missing { index, field: "id" })?;
    let coords = json_path(feature, &["geometry", "coordinates"])
        .and_then(JsonValue::as_array)
        .ok_or(RecordError::Missing {
            index,
            field: "geometry.coordinates",
        })?;
    let axis = |i: usize, field: &'static str, bound: f64| -> Result<f64, RecordError> {
        let value = coords
            .get(i)
            .and_then(JsonValue::as_f64)
            .ok_or(RecordError::Missing { index, field })?;
        if value.abs() > bound {
            return Err(RecordError::Invalid {
                index,
                field,
                value: value.to_string(),
            });
        }
        Ok(value)
    };
    let longitude = axis(0, "longitude", 180.0)?;
    let latitude = axis(1, "latitude", 90.0)?;
    let depth = coords.get(2).and_then(JsonValue::as_f64);

    let millis = json_i64(feature, &["properties", "time"]).ok_or(RecordError::Missing {
        index,
        field: "properties.time",
    })?;
    let time = datetime_from_epoch_millis(millis).ok_or(RecordError::Invalid {
        index,
        field: "properties.time",
        value: millis.to_string(),
    })?;

    Ok(EarthquakeEvent {
        id,
        latitude,
        longitude,
        depth,
        mag: json_f64(feature, &["properties", "mag"]),
        mag_type: json_str(feature, &["properties", "magType"]),
        sig: json_i64(feature, &["properties", "sig"]).and_then(|v| i32::try_from(v).ok()),
        tsunami: json_i64(feature, &["properties", "tsunami"])
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(0),
        place: json_str(feature, &["properties", "place"]).unwrap_or_else(|| "Unknown".to_string()),
        time,
    })
}

impl FeedAdapter for UsgsGeoJsonAdapter {
    fn domain(&self) -> Domain {
        Domain::Earthquake
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::GeoJson
    }

    fn parse(&self, payload: &[u8], policy: RecordErrorPolicy) -> Result<ParsedBatch, AdapterError> {
        let features = feature_list(payload, self.format())?;
        let parsed = features
            .iter()
            .enumerate()
            .map(|(index, feature)| parse_earthquake(index, feature));
        let (events, skipped) = collect_records(parsed, policy)?;
        Ok(ParsedBatch {
            batch: RecordBatch::Earthquakes(events),
            skipped,
        })
    }
}

// ---------------------------------------------------------------------------
// GDACS events

#[derive(Debug, Clone, Copy, Default)]
pub struct GdacsEventAdapter;

fn affected_countries(properties: &JsonValue) -> Vec<String> {
    properties
        .get("affectedcountries")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::String(name) => Some(name.trim().to_string()),
                    other => json_str(other, &["countryname"]),
                })
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn optional_timestamp(
    index: usize,
    props: &JsonValue,
    key: &'static str,
) -> Result<Option<DateTime<Utc>>, RecordError> {
    match json_str(props, &[key]) {
        None => Ok(None),
        Some(raw) => parse_feed_timestamp(&raw)
            .map(Some)
            .ok_or(RecordError::Invalid {
                index,
                field: key,
                value: raw,
            }),
    }
}

fn parse_hazard(index: usize, feature: &JsonValue) -> Result<HazardAlert, RecordError> {
    let props = feature.get("properties").ok_or(RecordError::Missing {
        index,
        field: "properties",
    })?;
    let event_id = json_i64(props, &["eventid"]).ok_or(RecordError::Missing {
        index,
        field: "eventid",
    })?;
    let event_type = json_str(props, &["eventtype"]).ok_or(RecordError::Missing {
        index,
        field: "eventtype",
    })?;
    let date_modified = optional_timestamp(index, props, "datemodified")?.ok_or(
        RecordError::Missing {
            index,
            field: "datemodified",
        },
    )?;

    Ok(HazardAlert {
        event_id,
        event_type: event_type.to_ascii_uppercase(),
        description: json_str(props, &["htmldescription"]),
        alert_score: json_f64(props, &["alertscore"]),
        country: json_str(props, &["country"]),
        affected_countries: affected_countries(props),
        from_date: optional_timestamp(index, props, "fromdate")?,
        to_date: optional_timestamp(index, props, "todate")?,
        date_modified,
        severity: SeverityData {
            severity: json_f64(props, &["severitydata", "severity"]),
            severity_text: json_str(props, &["severitydata", "severitytext"]),
            severity_unit: json_str(props, &["severitydata", "severityunit"]),
        },
        is_current: json_bool(props, &["iscurrent"]).unwrap_or(false),
        geometry_url: json_str(props, &["url", "geometry"]),
        report_url: json_str(props, &["url", "report"]),
    })
}

impl FeedAdapter for GdacsEventAdapter {
    fn domain(&self) -> Domain {
        Domain::Hazard
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Json
    }

    fn parse(&self, payload: &[u8], policy: RecordErrorPolicy) -> Result<ParsedBatch, AdapterError> {
        let features = feature_list(payload, self.format())?;
        let parsed = features
            .iter()
            .enumerate()
            .map(|(index, feature)| parse_hazard(index, feature));
        let (alerts, skipped) = collect_records(parsed, policy)?;
        Ok(ParsedBatch {
            batch: RecordBatch::Hazards(alerts),
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIIRS_CSV: &str = include_str!("../../../fixtures/firms/viirs_snpp_nrt.csv");
    const MODIS_CSV: &str = include_str!("../../../fixtures/firms/modis_nrt.csv");
    const USGS_GEOJSON: &str = include_str!("../../../fixtures/usgs/earthquakes.geojson");

    fn fires(parsed: ParsedBatch) -> Vec<FireDetection> {
        match parsed.batch {
            RecordBatch::Fires(rows) => rows,
            other => panic!("expected fires, got {:?}", other.domain()),
        }
    }

    fn quakes(parsed: ParsedBatch) -> Vec<EarthquakeEvent> {
        match parsed.batch {
            RecordBatch::Earthquakes(rows) => rows,
            other => panic!("expected earthquakes, got {:?}", other.domain()),
        }
    }

    #[test]
    fn viirs_rows_map_by_column_name() {
        let rows = fires(
            FirmsCsvAdapter
                .parse(VIIRS_CSV.as_bytes(), RecordErrorPolicy::AbortBatch)
                .expect("parse"),
        );
        assert_eq!(rows.len(), 3);
        let first = &rows[0];
        assert_eq!(first.latitude, 13.74931);
        assert_eq!(first.longitude, 100.52631);
        assert_eq!(first.acq_time, 542);
        assert_eq!(first.satellite, "N");
        assert_eq!(first.confidence.as_deref(), Some("n"));
        assert_eq!(first.bright_ti5, Some(297.41));
        assert_eq!(rows[2].bright_ti5, None);
    }

    #[test]
    fn modis_brightness_columns_fill_the_same_fields() {
        let rows = fires(
            FirmsCsvAdapter
                .parse(MODIS_CSV.as_bytes(), RecordErrorPolicy::AbortBatch)
                .expect("parse"),
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bright_ti4, Some(318.4));
        assert_eq!(rows[0].bright_ti5, Some(297.5));
        assert_eq!(rows[0].acq_time, 356);
        assert_eq!(rows[0].confidence.as_deref(), Some("64"));
    }

    #[test]
    fn missing_optional_columns_become_none() {
        let csv = "latitude,longitude,acq_date,acq_time,satellite\n10.5,99.1,2025-03-02,1200,G18\n";
        let rows = fires(
            FirmsCsvAdapter
                .parse(csv.as_bytes(), RecordErrorPolicy::AbortBatch)
                .expect("parse"),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].frp, None);
        assert_eq!(rows[0].instrument, None);
    }

    #[test]
    fn bad_fire_row_aborts_or_skips_per_policy() {
        let csv = "latitude,longitude,acq_date,acq_time,satellite\n\
                   10.5,99.1,2025-03-02,1200,N\n\
                   not-a-number,99.2,2025-03-02,1200,N\n\
                   10.7,99.3,2025-03-02,1201,N\n";

        let err = FirmsCsvAdapter
            .parse(csv.as_bytes(), RecordErrorPolicy::AbortBatch)
            .expect_err("abort");
        match err {
            AdapterError::Record(RecordError::Invalid { index, field, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(field, "latitude");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let parsed = FirmsCsvAdapter
            .parse(csv.as_bytes(), RecordErrorPolicy::SkipRecord)
            .expect("skip");
        assert_eq!(parsed.skipped.len(), 1);
        assert_eq!(fires(parsed).len(), 2);
    }

    #[test]
    fn non_csv_body_is_a_payload_error() {
        let err = FirmsCsvAdapter
            .parse(b"Invalid MAP_KEY.", RecordErrorPolicy::SkipRecord)
            .expect_err("payload");
        assert!(matches!(err, AdapterError::Payload { format: PayloadFormat::Csv, .. }));
    }

    #[test]
    fn header_only_csv_is_an_empty_batch() {
        let csv = "latitude,longitude,bright_ti4,scan,track,acq_date,acq_time,satellite,instrument,confidence,version,bright_ti5,frp,daynight\n";
        let parsed = FirmsCsvAdapter
            .parse(csv.as_bytes(), RecordErrorPolicy::AbortBatch)
            .expect("parse");
        assert!(parsed.batch.is_empty());
    }

    #[test]
    fn acq_time_accepts_short_forms_and_rejects_bad_clock_values() {
        assert_eq!(parse_hhmm("0005"), Some(5));
        assert_eq!(parse_hhmm("5"), Some(5));
        assert_eq!(parse_hhmm("2359"), Some(2359));
        assert_eq!(parse_hhmm("1261"), None);
        assert_eq!(parse_hhmm("2400"), None);
    }

    #[test]
    fn geojson_coordinates_are_reordered_to_lat_lon() {
        let parsed = UsgsGeoJsonAdapter
            .parse(USGS_GEOJSON.as_bytes(), RecordErrorPolicy::SkipRecord)
            .expect("parse");
        assert_eq!(parsed.skipped.len(), 1);
        let events = quakes(parsed);
        assert_eq!(events.len(), 2);

        let first = &events[0];
        assert_eq!(first.id, "us1000abcd");
        assert_eq!(first.latitude, 1.35);
        assert_eq!(first.longitude, 103.8);
        assert_eq!(first.depth, Some(10.0));
        assert_eq!(first.mag, Some(5.4));
        assert_eq!(first.mag_type.as_deref(), Some("mww"));
        assert_eq!(first.time.to_rfc3339(), "2023-11-14T22:13:20+00:00");

        assert_eq!(events[1].place, "Unknown");
        assert_eq!(events[1].tsunami, 1);
    }

    #[test]
    fn out_of_range_latitude_is_rejected() {
        let payload = r#"{"features":[{"id":"x1","properties":{"time":1700000000000},
            "geometry":{"coordinates":[1.35,103.8,10.0]}}]}"#;
        let err = UsgsGeoJsonAdapter
            .parse(payload.as_bytes(), RecordErrorPolicy::AbortBatch)
            .expect_err("latitude 103.8 is impossible");
        assert!(matches!(
            err,
            AdapterError::Record(RecordError::Invalid { field: "latitude", .. })
        ));
    }

    #[test]
    fn missing_features_array_is_a_payload_error() {
        let err = UsgsGeoJsonAdapter
            .parse(br#"{"type":"FeatureCollection"}"#, RecordErrorPolicy::SkipRecord)
            .expect_err("payload");
        assert!(matches!(err, AdapterError::Payload { .. }));
    }

    #[test]
    fn feed_timestamps_accept_naive_and_offset_forms() {
        let naive = parse_feed_timestamp("2025-06-11T08:00:00").unwrap();
        let offset = parse_feed_timestamp("2025-06-11T10:00:00+02:00").unwrap();
        assert_eq!(naive, offset);
        assert!(parse_feed_timestamp("2025-06-11").is_some());
        assert!(parse_feed_timestamp("yesterday").is_none());
    }
}
