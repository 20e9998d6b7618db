//! Yearly roll-over of the earthquake tables.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::store::{archive_table_for, ArchiveOutcome, StorageError, Store};

pub async fn run_archive_once(
    store: &dyn Store,
    table: &str,
    now: DateTime<Utc>,
) -> Result<ArchiveOutcome, StorageError> {
    let archive_table = archive_table_for(table);
    let outcome = store.archive_earthquakes(table, &archive_table, now).await?;
    match outcome {
        ArchiveOutcome::NotDue => {
            info!(table, "no events from a closed year; archive not due");
        }
        ArchiveOutcome::Archived { copied, pruned } => {
            info!(table, archive_table = %archive_table, copied, pruned, "earthquakes archived");
        }
    }
    Ok(outcome)
}

/// One cron job that archives each of `tables` in turn. The caller starts
/// and shuts down the returned scheduler.
pub async fn build_archive_scheduler(
    cron: &str,
    store: Arc<dyn Store>,
    tables: Vec<String>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating archive scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let store = store.clone();
        let tables = tables.clone();
        Box::pin(async move {
            for table in &tables {
                if let Err(err) = run_archive_once(store.as_ref(), table, Utc::now()).await {
                    warn!(
                        table = %table,
                        error = %err,
                        action = "retry_next_schedule",
                        "earthquake archive failed"
                    );
                }
            }
        })
    })
    .with_context(|| format!("creating archive job for cron {cron}"))?;
    sched.add(job).await.context("adding archive job")?;
    Ok(sched)
}
