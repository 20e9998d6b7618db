use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use geohaz_core::Domain;
use geohaz_sync::{
    build_archive_scheduler, build_domain_loops, earthquake_tables, http_fetcher, load_registry,
    run_archive_once, run_migrations, ArchiveOutcome, DomainLoop, Ingestor, PgStore,
    SourceRegistry, SyncConfig, SystemClock,
};
use geohaz_web::AppState;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "geohaz")]
#[command(about = "Geospatial hazard feed ingestion")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every enabled source until interrupted.
    Run,
    /// Run one cycle per domain and exit.
    Once {
        #[arg(long)]
        domain: Option<Domain>,
    },
    /// Apply database migrations.
    Migrate,
    /// Roll the earthquake tables over if the year has changed.
    Archive,
    /// Serve the read API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = SyncConfig::from_env()?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Once { domain } => once(config, domain).await,
        Commands::Migrate => {
            let store = connect(&config).await?;
            run_migrations(store.pool()).await
        }
        Commands::Archive => archive(config).await,
        Commands::Serve { port } => serve(config, port).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to storage")
}

async fn domain_loops(
    config: &SyncConfig,
    registry: &SourceRegistry,
    store: Arc<PgStore>,
    only: Option<Domain>,
) -> Result<Vec<DomainLoop>> {
    let fetcher = Arc::new(http_fetcher(config)?);
    let ingestor = Arc::new(Ingestor::from_config(config, fetcher, store));
    let loops = build_domain_loops(config, registry, ingestor, Arc::new(SystemClock), only).await?;
    if loops.is_empty() {
        bail!("no enabled sources in {}", config.sources_path.display());
    }
    Ok(loops)
}

async fn run(config: SyncConfig) -> Result<()> {
    let registry = load_registry(&config).await?;
    let store = Arc::new(connect(&config).await?);
    let loops = domain_loops(&config, &registry, store.clone(), None).await?;

    let mut archive_scheduler = if config.archive_enabled {
        let sched =
            build_archive_scheduler(&config.archive_cron, store.clone(), earthquake_tables(&registry))
                .await?;
        sched.start().await.context("starting archive scheduler")?;
        info!(cron = %config.archive_cron, "earthquake archive scheduled");
        Some(sched)
    } else {
        None
    };

    let mut signals = ShutdownSignals::install()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = loops
        .into_iter()
        .map(|domain_loop| {
            let domain = domain_loop.domain();
            (domain, tokio::spawn(domain_loop.run(shutdown_rx.clone())))
        })
        .collect();

    let signal = signals.recv().await?;
    info!(signal, "shutdown requested; letting in-flight sources finish");
    let _ = shutdown_tx.send(true);

    for (domain, handle) in handles {
        match handle.await {
            Ok(stats) => info!(
                %domain,
                cycles = stats.cycles,
                backoffs = stats.backoffs,
                source_failures = stats.source_failures,
                "domain loop joined"
            ),
            Err(err) => warn!(%domain, error = %err, "domain loop task failed"),
        }
    }
    if let Some(sched) = archive_scheduler.as_mut() {
        sched.shutdown().await.context("stopping archive scheduler")?;
    }
    Ok(())
}

/// SIGINT, plus SIGTERM on unix, which is what container runtimes send on stop.
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?,
        })
    }

    async fn recv(&mut self) -> Result<&'static str> {
        #[cfg(unix)]
        let terminate = self.terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT").context("waiting for ctrl-c"),
            _ = terminate => Ok("SIGTERM"),
        }
    }
}

async fn once(config: SyncConfig, only: Option<Domain>) -> Result<()> {
    let registry = load_registry(&config).await?;
    let store = Arc::new(connect(&config).await?);
    let loops = domain_loops(&config, &registry, store, only).await?;

    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    for mut domain_loop in loops {
        let domain = domain_loop.domain();
        let report = domain_loop
            .run_cycle(&mut shutdown_rx)
            .await
            .with_context(|| format!("{domain} cycle could not start"))?;
        println!(
            "{domain}: run_id={} written={} unchanged={} failed={}",
            report.run_id,
            report.written(),
            report.unchanged(),
            report.failed()
        );
        for source in &report.reports {
            if let Err(err) = &source.result {
                println!("  {} [{}]: {err}", source.source_id, err.kind().as_str());
            }
        }
    }
    Ok(())
}

async fn archive(config: SyncConfig) -> Result<()> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let store = connect(&config).await?;
    for table in earthquake_tables(&registry) {
        match run_archive_once(&store, &table, Utc::now()).await? {
            ArchiveOutcome::NotDue => println!("{table}: not due"),
            ArchiveOutcome::Archived { copied, pruned } => {
                println!("{table}: copied={copied} pruned={pruned}")
            }
        }
    }
    Ok(())
}

async fn serve(config: SyncConfig, port: Option<u16>) -> Result<()> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let store = connect(&config).await?;
    let port = port.unwrap_or(config.web_port);
    geohaz_web::serve(AppState::from_registry(store.pool().clone(), &registry), port).await
}
