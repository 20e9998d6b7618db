//! Dispatch of a parsed batch to the store operation its write policy names.

use geohaz_core::{RecordBatch, WritePolicy};

use crate::store::{StorageError, Store, WriteSummary};

/// Applies `batch` to `table` in a single transaction.
///
/// An empty batch under [`WritePolicy::ReplaceAll`] still clears the table:
/// the feed reported no current detections.
pub async fn apply_batch(
    store: &dyn Store,
    table: &str,
    policy: WritePolicy,
    batch: &RecordBatch,
) -> Result<WriteSummary, StorageError> {
    match (policy, batch) {
        (WritePolicy::ReplaceAll, RecordBatch::Fires(rows)) => store.replace_fires(table, rows).await,
        (WritePolicy::InsertIfAbsent, RecordBatch::Fires(rows)) => {
            store.insert_fires_if_absent(table, rows).await
        }
        (WritePolicy::InsertIfAbsent, RecordBatch::Earthquakes(rows)) => {
            store.insert_earthquakes_if_absent(table, rows).await
        }
        (WritePolicy::UpsertReplace, RecordBatch::Hazards(rows)) => {
            store.upsert_hazards(table, rows).await
        }
        (policy, batch) => Err(StorageError::Write {
            table: table.to_string(),
            message: format!(
                "write policy {} does not apply to {} records",
                policy.as_str(),
                batch.domain()
            ),
        }),
    }
}
