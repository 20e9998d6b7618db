//! One source, one attempt: fetch, fingerprint gate, parse, dedup, write, commit.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use geohaz_adapters::{AdapterError, RecordError};
use geohaz_core::RecordBatch;
use geohaz_storage::{FeedFetcher, FetchError, FetchErrorKind, FingerprintCache};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{SourceConfig, SyncConfig, UrlVars, DEFAULT_FIRE_AREA};
use crate::dedup::{DedupStats, HazardDeduplicator};
use crate::reconcile::apply_batch;
use crate::store::{StorageError, Store, WriteSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Remote,
    Record,
    Storage,
    Fingerprint,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Remote => "remote",
            ErrorKind::Record => "record",
            ErrorKind::Storage => "storage",
            ErrorKind::Fingerprint => "fingerprint",
        }
    }
}

/// What the scheduler does with a failed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// The payload itself is bad; the source is polled again next cycle but
    /// nothing is expected to change until the remote side does.
    SkippedThisCycle,
    /// Transient failure; the whole source is retried next cycle.
    RetryNextCycle,
}

impl FailureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureAction::SkippedThisCycle => "skipped_this_cycle",
            FailureAction::RetryNextCycle => "retry_next_cycle",
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The batch was committed but its digest was not; the payload is
    /// reprocessed next cycle.
    #[error("committing fingerprint: {0:#}")]
    Fingerprint(anyhow::Error),
}

impl From<AdapterError> for SourceError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Payload { .. } => SourceError::Payload(err.to_string()),
            AdapterError::Record(record) => SourceError::Record(record),
        }
    }
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Fetch(err) => match err.kind() {
                FetchErrorKind::Network => ErrorKind::Network,
                FetchErrorKind::Remote => ErrorKind::Remote,
            },
            SourceError::Payload(_) => ErrorKind::Remote,
            SourceError::Record(_) => ErrorKind::Record,
            SourceError::Storage(_) => ErrorKind::Storage,
            SourceError::Fingerprint(_) => ErrorKind::Fingerprint,
        }
    }

    pub fn action(&self) -> FailureAction {
        match self.kind() {
            ErrorKind::Remote | ErrorKind::Record => FailureAction::SkippedThisCycle,
            ErrorKind::Network | ErrorKind::Storage | ErrorKind::Fingerprint => {
                FailureAction::RetryNextCycle
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    /// Payload digest matched the last committed one; nothing was parsed or written.
    Unchanged { hash: String },
    Written {
        hash: String,
        parsed: usize,
        skipped_records: usize,
        dedup: Option<DedupStats>,
        write: WriteSummary,
        /// Newest observation among the records handed to the store.
        latest_observed_at: Option<DateTime<Utc>>,
    },
}

impl SourceOutcome {
    pub fn hash(&self) -> &str {
        match self {
            SourceOutcome::Unchanged { hash } | SourceOutcome::Written { hash, .. } => hash,
        }
    }
}

/// Shared by every domain loop. Holds no per-source state: the fingerprint
/// cache is owned by the calling loop.
pub struct Ingestor {
    fetcher: Arc<dyn FeedFetcher>,
    store: Arc<dyn Store>,
    dedup: HazardDeduplicator,
    map_key: Option<String>,
    area: String,
}

impl Ingestor {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, store: Arc<dyn Store>) -> Self {
        Self {
            fetcher,
            store,
            dedup: HazardDeduplicator::default(),
            map_key: None,
            area: DEFAULT_FIRE_AREA.to_string(),
        }
    }

    pub fn from_config(
        config: &SyncConfig,
        fetcher: Arc<dyn FeedFetcher>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self::new(fetcher, store)
            .with_dedup(HazardDeduplicator::new(config.excluded_hazard_types.clone()))
            .with_url_vars(config.firms_map_key.clone(), config.fire_area.clone())
    }

    pub fn with_dedup(mut self, dedup: HazardDeduplicator) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_url_vars(mut self, map_key: Option<String>, area: String) -> Self {
        self.map_key = map_key;
        self.area = area;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The fetch completes before any transaction opens, and the digest is
    /// committed only after the write transaction has.
    pub async fn process_source(
        &self,
        cache: &mut FingerprintCache,
        source: &SourceConfig,
        date: NaiveDate,
    ) -> Result<SourceOutcome, SourceError> {
        let url = source.render_url(&UrlVars {
            map_key: self.map_key.as_deref(),
            area: &self.area,
            date,
        });
        let fetched = self.fetcher.fetch(&source.source_id, &url).await?;

        let check = cache.should_process(&source.source_id, &fetched.body);
        if !check.changed {
            return Ok(SourceOutcome::Unchanged { hash: check.hash });
        }

        let parsed = geohaz_adapters::parse(source.domain, &fetched.body, source.record_error_policy())?;
        for skipped in &parsed.skipped {
            warn!(error = %skipped, action = "record_skipped", "dropping unparseable record");
        }
        let parsed_count = parsed.batch.len();

        let (batch, dedup) = match parsed.batch {
            RecordBatch::Hazards(alerts) => {
                let result = self.dedup.apply(alerts);
                debug!(
                    received = result.stats.received,
                    superseded = result.stats.superseded,
                    not_current = result.stats.not_current,
                    excluded = result.stats.excluded,
                    "hazard revisions reduced"
                );
                (RecordBatch::Hazards(result.kept), Some(result.stats))
            }
            other => (other, None),
        };

        let latest_observed_at = batch.latest_observed_at();
        let write = apply_batch(self.store.as_ref(), &source.table, source.write_policy(), &batch).await?;
        cache
            .commit(&source.source_id, &check.hash)
            .await
            .map_err(SourceError::Fingerprint)?;

        Ok(SourceOutcome::Written {
            hash: check.hash,
            parsed: parsed_count,
            skipped_records: parsed.skipped.len(),
            dedup,
            write,
            latest_observed_at,
        })
    }
}
