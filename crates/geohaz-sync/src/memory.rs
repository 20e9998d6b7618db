//! In-process [`Store`] with the same conflict semantics as [`crate::PgStore`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geohaz_core::{EarthquakeEvent, FireDetection, HazardAlert};
use tokio::sync::Mutex;

use crate::store::{
    archive_cutoff, archive_due, year_start, ArchiveOutcome, StorageError, Store, WriteSummary,
};

#[derive(Debug, Default)]
struct MemoryState {
    fires: BTreeMap<String, BTreeMap<String, FireDetection>>,
    earthquakes: BTreeMap<String, BTreeMap<String, EarthquakeEvent>>,
    hazards: BTreeMap<String, BTreeMap<i64, HazardAlert>>,
    unavailable: bool,
    failing_tables: BTreeSet<String>,
    commits: u64,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable {
            Err(StorageError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Fails after the new table contents were staged, before they replace the old ones.
    fn check_commit(&self, table: &str) -> Result<(), StorageError> {
        if self.failing_tables.contains(table) {
            Err(StorageError::Write {
                table: table.to_string(),
                message: "injected failure before commit".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Writes are staged on a copy of the table and swapped in only when the
/// whole batch succeeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.unavailable = !available;
    }

    pub async fn fail_writes_to(&self, table: &str) {
        self.state.lock().await.failing_tables.insert(table.to_string());
    }

    pub async fn heal(&self, table: &str) {
        self.state.lock().await.failing_tables.remove(table);
    }

    /// Number of committed write transactions across all tables.
    pub async fn commits(&self) -> u64 {
        self.state.lock().await.commits
    }

    pub async fn fires(&self, table: &str) -> Vec<FireDetection> {
        let state = self.state.lock().await;
        state
            .fires
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn earthquakes(&self, table: &str) -> Vec<EarthquakeEvent> {
        let state = self.state.lock().await;
        state
            .earthquakes
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn hazards(&self, table: &str) -> Vec<HazardAlert> {
        let state = self.state.lock().await;
        state
            .hazards
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn insert_fires(
        &self,
        table: &str,
        rows: &[FireDetection],
        clear_first: bool,
    ) -> Result<WriteSummary, StorageError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let mut staged = if clear_first {
            BTreeMap::new()
        } else {
            state.fires.get(table).cloned().unwrap_or_default()
        };
        let deleted = if clear_first {
            state.fires.get(table).map_or(0, |t| t.len() as u64)
        } else {
            0
        };
        let mut summary = WriteSummary {
            deleted,
            ..WriteSummary::default()
        };
        for row in rows {
            let key = row.natural_key();
            if staged.contains_key(&key) {
                summary.skipped += 1;
            } else {
                staged.insert(key, row.clone());
                summary.inserted += 1;
            }
        }

        state.check_commit(table)?;
        state.fires.insert(table.to_string(), staged);
        state.commits += 1;
        Ok(summary)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.state.lock().await.check_available()
    }

    async fn replace_fires(
        &self,
        table: &str,
        rows: &[FireDetection],
    ) -> Result<WriteSummary, StorageError> {
        self.insert_fires(table, rows, true).await
    }

    async fn insert_fires_if_absent(
        &self,
        table: &str,
        rows: &[FireDetection],
    ) -> Result<WriteSummary, StorageError> {
        self.insert_fires(table, rows, false).await
    }

    async fn insert_earthquakes_if_absent(
        &self,
        table: &str,
        rows: &[EarthquakeEvent],
    ) -> Result<WriteSummary, StorageError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let mut staged = state.earthquakes.get(table).cloned().unwrap_or_default();
        let mut summary = WriteSummary::default();
        for row in rows {
            if staged.contains_key(&row.id) {
                summary.skipped += 1;
            } else {
                staged.insert(row.id.clone(), row.clone());
                summary.inserted += 1;
            }
        }

        state.check_commit(table)?;
        state.earthquakes.insert(table.to_string(), staged);
        state.commits += 1;
        Ok(summary)
    }

    async fn upsert_hazards(
        &self,
        table: &str,
        rows: &[HazardAlert],
    ) -> Result<WriteSummary, StorageError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let mut staged = state.hazards.get(table).cloned().unwrap_or_default();
        let mut summary = WriteSummary::default();
        for row in rows {
            match staged.get(&row.event_id) {
                Some(stored) if stored.date_modified > row.date_modified => summary.skipped += 1,
                Some(_) => {
                    staged.insert(row.event_id, row.clone());
                    summary.updated += 1;
                }
                None => {
                    staged.insert(row.event_id, row.clone());
                    summary.inserted += 1;
                }
            }
        }

        state.check_commit(table)?;
        state.hazards.insert(table.to_string(), staged);
        state.commits += 1;
        Ok(summary)
    }

    async fn archive_earthquakes(
        &self,
        table: &str,
        archive_table: &str,
        now: DateTime<Utc>,
    ) -> Result<ArchiveOutcome, StorageError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let current = state.earthquakes.get(table).cloned().unwrap_or_default();
        let oldest = current.values().map(|e| e.time).min();
        if !archive_due(oldest, now) {
            return Ok(ArchiveOutcome::NotDue);
        }

        let mut archive = state.earthquakes.get(archive_table).cloned().unwrap_or_default();
        let closed_before = year_start(now);
        let mut copied = 0;
        for (id, event) in current.iter().filter(|(_, e)| e.time < closed_before) {
            if !archive.contains_key(id) {
                archive.insert(id.clone(), event.clone());
                copied += 1;
            }
        }
        let cutoff = archive_cutoff(now);
        let retained: BTreeMap<String, EarthquakeEvent> = current
            .into_iter()
            .filter(|(_, e)| e.time >= cutoff)
            .collect();
        let pruned = state.earthquakes.get(table).map_or(0, |t| t.len()) - retained.len();

        state.check_commit(table)?;
        state.earthquakes.insert(archive_table.to_string(), archive);
        state.earthquakes.insert(table.to_string(), retained);
        state.commits += 1;
        Ok(ArchiveOutcome::Archived {
            copied,
            pruned: pruned as u64,
        })
    }
}
