//! Transactional persistence for parsed feed records.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use geohaz_core::{EarthquakeEvent, FireDetection, HazardAlert};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use thiserror::Error;

use crate::config::is_valid_table_name;

/// Archived rows younger than this stay in the current earthquake table.
pub const ARCHIVE_RETENTION_DAYS: i64 = 30;

const FIRE_COLUMNS: &str = "latitude, longitude, bright_ti4, scan, track, acq_date, acq_time, \
     satellite, instrument, confidence, version, bright_ti5, frp, daynight";
const FIRE_NATURAL_KEY: &str = "(satellite, acq_date, acq_time, latitude, longitude)";
const EARTHQUAKE_COLUMNS: &str = "id, latitude, longitude, depth, mag, magtype, sig, tsunami, place, time";

// Postgres caps a statement at 65535 bind parameters.
const FIRE_CHUNK: usize = 2_000;
const EARTHQUAKE_CHUNK: usize = 4_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("write to `{table}` failed: {message}")]
    Write { table: String, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Row counts of one committed write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub deleted: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Records dropped by a uniqueness conflict.
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    NotDue,
    Archived { copied: u64, pruned: u64 },
}

/// Midnight UTC on 1 January of `now`'s year. Rows before it belong to a closed year.
pub fn year_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Due while the current table still holds events from a closed year, no
/// matter how many events of the new year have arrived since.
pub fn archive_due(oldest_event: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    oldest_event.is_some_and(|oldest| oldest < year_start(now))
}

/// Rows before this are pruned. Never later than the start of the year, so
/// only rows that were copied to the archive are removed.
pub fn archive_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    (now - ChronoDuration::days(ARCHIVE_RETENTION_DAYS)).min(year_start(now))
}

pub fn archive_table_for(table: &str) -> String {
    format!("{table}_archive")
}

/// Every write method runs in exactly one transaction: it is either fully
/// applied or not at all.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;

    async fn replace_fires(
        &self,
        table: &str,
        rows: &[FireDetection],
    ) -> Result<WriteSummary, StorageError>;

    async fn insert_fires_if_absent(
        &self,
        table: &str,
        rows: &[FireDetection],
    ) -> Result<WriteSummary, StorageError>;

    async fn insert_earthquakes_if_absent(
        &self,
        table: &str,
        rows: &[EarthquakeEvent],
    ) -> Result<WriteSummary, StorageError>;

    async fn upsert_hazards(
        &self,
        table: &str,
        rows: &[HazardAlert],
    ) -> Result<WriteSummary, StorageError>;

    async fn archive_earthquakes(
        &self,
        table: &str,
        archive_table: &str,
        now: DateTime<Utc>,
    ) -> Result<ArchiveOutcome, StorageError>;
}

fn quoted(table: &str) -> Result<String, StorageError> {
    if is_valid_table_name(table) {
        Ok(format!("\"{table}\""))
    } else {
        Err(StorageError::InvalidTable(table.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_fire_rows(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        rows: &[FireDetection],
    ) -> Result<u64, sqlx::Error> {
        let mut inserted = 0;
        for chunk in rows.chunks(FIRE_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} ({FIRE_COLUMNS}) "));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.latitude)
                    .push_bind(row.longitude)
                    .push_bind(row.bright_ti4)
                    .push_bind(row.scan)
                    .push_bind(row.track)
                    .push_bind(row.acq_date)
                    .push_bind(row.acq_time)
                    .push_bind(row.satellite.clone())
                    .push_bind(row.instrument.clone())
                    .push_bind(row.confidence.clone())
                    .push_bind(row.version.clone())
                    .push_bind(row.bright_ti5)
                    .push_bind(row.frp)
                    .push_bind(row.daynight.clone());
            });
            qb.push(format!(" ON CONFLICT {FIRE_NATURAL_KEY} DO NOTHING"));
            inserted += qb.build().execute(&mut **tx).await?.rows_affected();
        }
        Ok(inserted)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn replace_fires(
        &self,
        table: &str,
        rows: &[FireDetection],
    ) -> Result<WriteSummary, StorageError> {
        let table = quoted(table)?;
        // DELETE rather than TRUNCATE: readers keep seeing the old rows until commit.
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let inserted = Self::insert_fire_rows(&mut tx, &table, rows).await?;
        tx.commit().await?;
        Ok(WriteSummary {
            deleted,
            inserted,
            updated: 0,
            skipped: rows.len() as u64 - inserted,
        })
    }

    async fn insert_fires_if_absent(
        &self,
        table: &str,
        rows: &[FireDetection],
    ) -> Result<WriteSummary, StorageError> {
        let table = quoted(table)?;
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_fire_rows(&mut tx, &table, rows).await?;
        tx.commit().await?;
        Ok(WriteSummary {
            inserted,
            skipped: rows.len() as u64 - inserted,
            ..WriteSummary::default()
        })
    }

    async fn insert_earthquakes_if_absent(
        &self,
        table: &str,
        rows: &[EarthquakeEvent],
    ) -> Result<WriteSummary, StorageError> {
        let table = quoted(table)?;
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in rows.chunks(EARTHQUAKE_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} ({EARTHQUAKE_COLUMNS}) "));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id.clone())
                    .push_bind(row.latitude)
                    .push_bind(row.longitude)
                    .push_bind(row.depth)
                    .push_bind(row.mag)
                    .push_bind(row.mag_type.clone())
                    .push_bind(row.sig)
                    .push_bind(row.tsunami)
                    .push_bind(row.place.clone())
                    .push_bind(row.time);
            });
            qb.push(" ON CONFLICT (id) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(WriteSummary {
            inserted,
            skipped: rows.len() as u64 - inserted,
            ..WriteSummary::default()
        })
    }

    async fn upsert_hazards(
        &self,
        table: &str,
        rows: &[HazardAlert],
    ) -> Result<WriteSummary, StorageError> {
        let table = quoted(table)?;
        let sql = format!(
            "INSERT INTO {table} (
                id, type, description, score, org_country,
                from_date, to_date, date_modified, affectedcountries,
                severity, severitytext, severityunit, iscurrent,
                geom_url, report_url
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE
            SET type = EXCLUDED.type,
                description = EXCLUDED.description,
                score = EXCLUDED.score,
                org_country = EXCLUDED.org_country,
                from_date = EXCLUDED.from_date,
                to_date = EXCLUDED.to_date,
                date_modified = EXCLUDED.date_modified,
                affectedcountries = EXCLUDED.affectedcountries,
                severity = EXCLUDED.severity,
                severitytext = EXCLUDED.severitytext,
                severityunit = EXCLUDED.severityunit,
                iscurrent = EXCLUDED.iscurrent,
                geom_url = EXCLUDED.geom_url,
                report_url = EXCLUDED.report_url
            WHERE {table}.date_modified <= EXCLUDED.date_modified
            RETURNING (xmax = 0) AS inserted"
        );

        let mut tx = self.pool.begin().await?;
        let mut summary = WriteSummary::default();
        for row in rows {
            let returned = sqlx::query(&sql)
                .bind(row.event_id)
                .bind(&row.event_type)
                .bind(&row.description)
                .bind(row.alert_score)
                .bind(&row.country)
                .bind(row.from_date)
                .bind(row.to_date)
                .bind(row.date_modified)
                .bind(row.affected_countries_joined())
                .bind(row.severity.severity)
                .bind(&row.severity.severity_text)
                .bind(&row.severity.severity_unit)
                .bind(row.is_current)
                .bind(&row.geometry_url)
                .bind(&row.report_url)
                .fetch_optional(&mut *tx)
                .await?;
            // No row back: the stored revision is newer and was kept.
            match returned {
                Some(row) if row.try_get::<bool, _>("inserted")? => summary.inserted += 1,
                Some(_) => summary.updated += 1,
                None => summary.skipped += 1,
            }
        }
        tx.commit().await?;
        Ok(summary)
    }

    async fn archive_earthquakes(
        &self,
        table: &str,
        archive_table: &str,
        now: DateTime<Utc>,
    ) -> Result<ArchiveOutcome, StorageError> {
        let table = quoted(table)?;
        let archive_table = quoted(archive_table)?;

        let mut tx = self.pool.begin().await?;
        let oldest: Option<DateTime<Utc>> =
            sqlx::query_scalar(&format!("SELECT MIN(time) FROM {table}"))
                .fetch_one(&mut *tx)
                .await?;
        if !archive_due(oldest, now) {
            tx.rollback().await?;
            return Ok(ArchiveOutcome::NotDue);
        }

        let copied = sqlx::query(&format!(
            "INSERT INTO {archive_table} ({EARTHQUAKE_COLUMNS}) \
             SELECT {EARTHQUAKE_COLUMNS} FROM {table} WHERE time < $1 \
             ON CONFLICT (id) DO NOTHING"
        ))
        .bind(year_start(now))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let pruned = sqlx::query(&format!("DELETE FROM {table} WHERE time < $1"))
            .bind(archive_cutoff(now))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(ArchiveOutcome::Archived { copied, pruned })
    }
}
