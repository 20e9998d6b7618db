//! Per-domain polling loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geohaz_core::Domain;
use geohaz_storage::FingerprintCache;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{LoopTiming, SourceConfig};
use crate::pipeline::{Ingestor, SourceError, SourceOutcome};
use crate::store::StorageError;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug)]
pub struct SourceReport {
    pub source_id: String,
    pub result: Result<SourceOutcome, SourceError>,
}

#[derive(Debug)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub domain: Domain,
    pub started_at: DateTime<Utc>,
    pub reports: Vec<SourceReport>,
}

impl CycleReport {
    pub fn written(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.result, Ok(SourceOutcome::Written { .. })))
            .count()
    }

    pub fn unchanged(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.result, Ok(SourceOutcome::Unchanged { .. })))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.reports.iter().filter(|r| r.result.is_err()).count()
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceReport> {
        self.reports.iter().find(|r| r.source_id == source_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub backoffs: u64,
    pub source_failures: u64,
}

/// Sleeps for `duration` unless shutdown is requested first. Returns `true`
/// on shutdown; a dropped sender counts as one.
pub async fn pause_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        if *shutdown.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
        }
    }
}

/// Polls the sources of one domain sequentially, forever. Owns the domain's
/// fingerprint cache; nothing mutable is shared with other loops.
pub struct DomainLoop {
    domain: Domain,
    sources: Vec<SourceConfig>,
    timing: LoopTiming,
    ingestor: Arc<Ingestor>,
    cache: FingerprintCache,
    clock: Arc<dyn Clock>,
}

impl DomainLoop {
    pub fn new(
        domain: Domain,
        sources: Vec<SourceConfig>,
        timing: LoopTiming,
        ingestor: Arc<Ingestor>,
        cache: FingerprintCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            domain,
            sources,
            timing,
            ingestor,
            cache,
            clock,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn timing(&self) -> LoopTiming {
        self.timing
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// One pass over every source. Fails only when storage is unreachable,
    /// before any source has been attempted; per-source failures are
    /// reported in the returned [`CycleReport`].
    pub async fn run_cycle(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CycleReport, StorageError> {
        self.ingestor.store().ping().await?;

        let started_at = self.clock.now();
        let run_id = Uuid::new_v4();
        let date = started_at.date_naive();
        let mut reports = Vec::with_capacity(self.sources.len());

        for (index, source) in self.sources.iter().enumerate() {
            if index > 0 && pause_or_shutdown(self.timing.source_pause, shutdown).await {
                info!(domain = %self.domain, "shutdown requested mid-cycle");
                break;
            }

            let span = info_span!(
                "poll_source",
                %run_id,
                domain = %self.domain,
                source_id = %source.source_id,
                table = %source.table,
            );
            let result = self
                .ingestor
                .process_source(&mut self.cache, source, date)
                .instrument(span.clone())
                .await;
            span.in_scope(|| log_source_result(&result));

            reports.push(SourceReport {
                source_id: source.source_id.clone(),
                result,
            });
        }

        Ok(CycleReport {
            run_id,
            domain: self.domain,
            started_at,
            reports,
        })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        let mut stats = LoopStats::default();
        info!(
            domain = %self.domain,
            sources = self.sources.len(),
            cycle_pause_secs = self.timing.cycle_pause.as_secs(),
            "domain loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.run_cycle(&mut shutdown).await {
                Ok(report) => {
                    stats.cycles += 1;
                    stats.source_failures += report.failed() as u64;
                    info!(
                        run_id = %report.run_id,
                        domain = %self.domain,
                        written = report.written(),
                        unchanged = report.unchanged(),
                        failed = report.failed(),
                        "cycle finished"
                    );
                    self.timing.cycle_pause
                }
                Err(err) => {
                    stats.backoffs += 1;
                    warn!(
                        domain = %self.domain,
                        error = %err,
                        action = "backing_off",
                        backoff_secs = self.timing.storage_backoff.as_secs(),
                        "storage unavailable; no source attempted"
                    );
                    self.timing.storage_backoff
                }
            };
            if pause_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }

        info!(domain = %self.domain, cycles = stats.cycles, "domain loop stopped");
        stats
    }
}

fn log_source_result(result: &Result<SourceOutcome, SourceError>) {
    match result {
        Ok(SourceOutcome::Unchanged { hash }) => {
            info!(hash = %hash, "payload unchanged");
        }
        Ok(SourceOutcome::Written {
            parsed,
            skipped_records,
            write,
            latest_observed_at,
            ..
        }) => {
            info!(
                parsed,
                skipped_records,
                latest_observed_at = ?latest_observed_at,
                deleted = write.deleted,
                inserted = write.inserted,
                updated = write.updated,
                conflicts = write.skipped,
                "source written"
            );
        }
        Err(err) => {
            warn!(
                kind = err.kind().as_str(),
                action = err.action().as_str(),
                error = %err,
                "source failed"
            );
        }
    }
}
