//! Ingestion runtime for geohaz: source registry, reconciliation against
//! Postgres, per-domain polling loops and the yearly earthquake archive.

pub mod archive;
pub mod config;
pub mod dedup;
pub mod memory;
pub mod pipeline;
pub mod reconcile;
pub mod scheduler;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use geohaz_core::Domain;
use geohaz_storage::{FingerprintCache, HttpClientConfig, HttpFetcher};
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::info;

pub use archive::{build_archive_scheduler, run_archive_once};
pub use config::{LoopTiming, SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::{DedupResult, DedupStats, HazardDeduplicator};
pub use memory::MemoryStore;
pub use pipeline::{ErrorKind, FailureAction, Ingestor, SourceError, SourceOutcome};
pub use reconcile::apply_batch;
pub use scheduler::{
    pause_or_shutdown, Clock, CycleReport, DomainLoop, FixedClock, LoopStats, SourceReport,
    SystemClock,
};
pub use store::{ArchiveOutcome, PgStore, StorageError, Store, WriteSummary};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("running database migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "database schema up to date");
    Ok(())
}

pub fn http_fetcher(config: &SyncConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })
}

/// Loads the registry named by `config` and checks it against the
/// environment. Both failures are fatal at startup.
pub async fn load_registry(config: &SyncConfig) -> Result<SourceRegistry> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    registry.validate_against(config)?;
    Ok(registry)
}

/// One loop per active domain, or only `only` when given. Each loop loads
/// its own fingerprint file.
pub async fn build_domain_loops(
    config: &SyncConfig,
    registry: &SourceRegistry,
    ingestor: Arc<Ingestor>,
    clock: Arc<dyn Clock>,
    only: Option<Domain>,
) -> Result<Vec<DomainLoop>> {
    let mut loops = Vec::new();
    for domain in registry.active_domains() {
        if only.is_some_and(|d| d != domain) {
            continue;
        }
        let path = config.fingerprint_path(domain);
        let cache = FingerprintCache::load(&path)
            .await
            .with_context(|| format!("loading fingerprints for {domain}"))?;
        info!(%domain, path = %path.display(), entries = cache.len(), "fingerprints loaded");
        loops.push(DomainLoop::new(
            domain,
            registry.enabled_for(domain),
            registry.timing_for(domain),
            ingestor.clone(),
            cache,
            clock.clone(),
        ));
    }
    Ok(loops)
}

/// Tables written by enabled earthquake sources; these are the ones archived.
pub fn earthquake_tables(registry: &SourceRegistry) -> Vec<String> {
    let mut tables: Vec<String> = registry
        .enabled_for(Domain::Earthquake)
        .into_iter()
        .map(|s| s.table)
        .collect();
    tables.sort();
    tables.dedup();
    tables
}
