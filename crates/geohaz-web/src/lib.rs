//! Read-only JSON view over the hazard tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use geohaz_core::{Domain, EarthquakeEvent, FireDetection, HazardAlert, SeverityData};
use geohaz_sync::SourceRegistry;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const DEFAULT_LIMIT: i64 = 200;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Fire source id to table name.
    pub fire_tables: BTreeMap<String, String>,
    pub earthquake_table: String,
    pub hazard_table: String,
}

impl AppState {
    pub fn from_registry(pool: PgPool, registry: &SourceRegistry) -> Self {
        let first_table = |domain: Domain, fallback: &str| {
            registry
                .enabled_for(domain)
                .into_iter()
                .next()
                .map(|s| s.table)
                .unwrap_or_else(|| fallback.to_string())
        };
        Self {
            fire_tables: registry
                .enabled_for(Domain::Fire)
                .into_iter()
                .map(|s| (s.source_id, s.table))
                .collect(),
            earthquake_table: first_table(Domain::Earthquake, "earthquakes"),
            hazard_table: first_table(Domain::Hazard, "gdacs_live"),
            pool,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    /// `(limit, offset)` clamped to what the handlers accept.
    pub fn window(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/earthquakes", get(earthquakes_handler))
        .route("/hazards", get(hazards_handler))
        .route("/fires/{source_id}", get(fires_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "service": "geohaz",
        "version": env!("CARGO_PKG_VERSION"),
        "earthquakes": state.earthquake_table,
        "hazards": state.hazard_table,
        "fire_sources": state.fire_tables.keys().collect::<Vec<_>>(),
    }))
    .into_response()
}

async fn earthquakes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let (limit, offset) = query.window();
    let sql = format!(
        "SELECT id, latitude, longitude, depth, mag, magtype, sig, tsunami, place, time
           FROM \"{}\"
          ORDER BY time DESC
          LIMIT $1 OFFSET $2",
        state.earthquake_table
    );
    match fetch_rows(&state.pool, &sql, limit, offset, earthquake_from_row).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn hazards_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let (limit, offset) = query.window();
    let sql = format!(
        "SELECT id, type, description, score, org_country, from_date, to_date, date_modified,
                affectedcountries, severity, severitytext, severityunit, iscurrent, geom_url, report_url
           FROM \"{}\"
          ORDER BY date_modified DESC
          LIMIT $1 OFFSET $2",
        state.hazard_table
    );
    match fetch_rows(&state.pool, &sql, limit, offset, hazard_from_row).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn fires_handler(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let Some(table) = state.fire_tables.get(&source_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown fire source `{source_id}`") })),
        )
            .into_response();
    };
    let (limit, offset) = query.window();
    let sql = format!(
        "SELECT latitude, longitude, bright_ti4, scan, track, acq_date, acq_time, satellite,
                instrument, confidence, version, bright_ti5, frp, daynight
           FROM \"{table}\"
          ORDER BY acq_date DESC, acq_time DESC
          LIMIT $1 OFFSET $2"
    );
    match fetch_rows(&state.pool, &sql, limit, offset, fire_from_row).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: sqlx::Error) -> Response {
    error!(error = %err, "read query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "database query failed" })),
    )
        .into_response()
}

async fn fetch_rows<T>(
    pool: &PgPool,
    sql: &str,
    limit: i64,
    offset: i64,
    map: fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, sqlx::Error> {
    let rows = sqlx::query(sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map).collect()
}

fn earthquake_from_row(row: &PgRow) -> Result<EarthquakeEvent, sqlx::Error> {
    Ok(EarthquakeEvent {
        id: row.try_get("id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        depth: row.try_get("depth")?,
        mag: row.try_get("mag")?,
        mag_type: row.try_get("magtype")?,
        sig: row.try_get("sig")?,
        tsunami: row.try_get("tsunami")?,
        place: row.try_get("place")?,
        time: row.try_get("time")?,
    })
}

fn hazard_from_row(row: &PgRow) -> Result<HazardAlert, sqlx::Error> {
    let countries: String = row.try_get("affectedcountries")?;
    Ok(HazardAlert {
        event_id: row.try_get("id")?,
        event_type: row.try_get("type")?,
        description: row.try_get("description")?,
        alert_score: row.try_get("score")?,
        country: row.try_get("org_country")?,
        affected_countries: split_countries(&countries),
        from_date: row.try_get("from_date")?,
        to_date: row.try_get("to_date")?,
        date_modified: row.try_get("date_modified")?,
        severity: SeverityData {
            severity: row.try_get("severity")?,
            severity_text: row.try_get("severitytext")?,
            severity_unit: row.try_get("severityunit")?,
        },
        is_current: row.try_get("iscurrent")?,
        geometry_url: row.try_get("geom_url")?,
        report_url: row.try_get("report_url")?,
    })
}

fn fire_from_row(row: &PgRow) -> Result<FireDetection, sqlx::Error> {
    Ok(FireDetection {
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        bright_ti4: row.try_get("bright_ti4")?,
        scan: row.try_get("scan")?,
        track: row.try_get("track")?,
        acq_date: row.try_get("acq_date")?,
        acq_time: row.try_get("acq_time")?,
        satellite: row.try_get("satellite")?,
        instrument: row.try_get("instrument")?,
        confidence: row.try_get("confidence")?,
        version: row.try_get("version")?,
        bright_ti5: row.try_get("bright_ti5")?,
        frp: row.try_get("frp")?,
        daynight: row.try_get("daynight")?,
    })
}

fn split_countries(joined: &str) -> Vec<String> {
    joined
        .split(", ")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
