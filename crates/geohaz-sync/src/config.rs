use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use geohaz_core::{Domain, RecordErrorPolicy, WritePolicy};
use serde::Deserialize;
use tokio::fs;

pub const DEFAULT_FIRE_AREA: &str = "60,5,150,55";
/// `sec min hour day-of-month month day-of-week`: midnight UTC on 1 January.
pub const DEFAULT_ARCHIVE_CRON: &str = "0 0 0 1 1 *";
pub const DEFAULT_WEB_PORT: u16 = 8000;
pub const DEFAULT_EXCLUDED_HAZARD_TYPES: [&str; 2] = ["EQ", "WF"];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub sources_path: PathBuf,
    pub state_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub firms_map_key: Option<String>,
    pub fire_area: String,
    pub excluded_hazard_types: Vec<String>,
    pub archive_enabled: bool,
    pub archive_cron: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = non_empty("DATABASE_URL").context("DATABASE_URL is not set")?;
        Ok(Self {
            database_url,
            db_max_connections: non_empty("GEOHAZ_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            sources_path: non_empty("GEOHAZ_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            state_dir: non_empty("GEOHAZ_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            user_agent: non_empty("GEOHAZ_USER_AGENT").unwrap_or_else(|| "geohaz-ingest/0.1".to_string()),
            http_timeout_secs: non_empty("GEOHAZ_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            firms_map_key: non_empty("FIRMS_MAP_KEY"),
            fire_area: non_empty("GEOHAZ_FIRE_AREA").unwrap_or_else(|| DEFAULT_FIRE_AREA.to_string()),
            excluded_hazard_types: non_empty("GEOHAZ_HAZARD_EXCLUDED_TYPES")
                .map(|v| {
                    v.split(',')
                        .map(|t| t.trim().to_ascii_uppercase())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| {
                    DEFAULT_EXCLUDED_HAZARD_TYPES
                        .iter()
                        .map(|t| t.to_string())
                        .collect()
                }),
            archive_enabled: non_empty("GEOHAZ_ARCHIVE_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            archive_cron: non_empty("GEOHAZ_ARCHIVE_CRON")
                .unwrap_or_else(|| DEFAULT_ARCHIVE_CRON.to_string()),
            web_port: non_empty("GEOHAZ_WEB_PORT")
                .map(|v| {
                    v.parse()
                        .with_context(|| format!("GEOHAZ_WEB_PORT `{v}` is not a port number"))
                })
                .transpose()?
                .unwrap_or(DEFAULT_WEB_PORT),
        })
    }

    /// One fingerprint file per domain so each loop owns its own cache.
    pub fn fingerprint_path(&self, domain: Domain) -> PathBuf {
        self.state_dir.join(format!("fingerprints-{domain}.json"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub domain: Domain,
    pub endpoint: String,
    pub table: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub write_policy: Option<WritePolicy>,
    #[serde(default)]
    pub on_record_error: Option<RecordErrorPolicy>,
}

fn enabled_by_default() -> bool {
    true
}

/// Values substituted into endpoint templates.
#[derive(Debug, Clone)]
pub struct UrlVars<'a> {
    pub map_key: Option<&'a str>,
    pub area: &'a str,
    pub date: NaiveDate,
}

impl SourceConfig {
    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
            .unwrap_or_else(|| WritePolicy::default_for(self.domain))
    }

    pub fn record_error_policy(&self) -> RecordErrorPolicy {
        self.on_record_error
            .unwrap_or_else(|| self.write_policy().default_record_error_policy())
    }

    pub fn render_url(&self, vars: &UrlVars<'_>) -> String {
        let mut url = self
            .endpoint
            .replace("{source}", &self.source_id)
            .replace("{area}", vars.area)
            .replace("{date}", &vars.date.format("%Y-%m-%d").to_string());
        if let Some(key) = vars.map_key {
            url = url.replace("{map_key}", key);
        }
        url
    }

    fn needs_map_key(&self) -> bool {
        self.endpoint.contains("{map_key}")
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ScheduleOverrides {
    pub source_pause_ms: Option<u64>,
    pub cycle_pause_secs: Option<u64>,
    pub storage_backoff_secs: Option<u64>,
}

/// Pauses applied by one domain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    pub source_pause: Duration,
    pub cycle_pause: Duration,
    pub storage_backoff: Duration,
}

impl LoopTiming {
    pub fn default_for(domain: Domain) -> Self {
        let (source_pause, cycle_pause) = match domain {
            Domain::Fire => (Duration::from_secs(5), Duration::from_secs(30)),
            Domain::Earthquake => (Duration::from_millis(250), Duration::from_secs(30)),
            Domain::Hazard => (Duration::from_millis(250), Duration::from_secs(10)),
        };
        Self {
            source_pause,
            cycle_pause,
            storage_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_overrides(mut self, overrides: &ScheduleOverrides) -> Self {
        if let Some(ms) = overrides.source_pause_ms {
            self.source_pause = Duration::from_millis(ms);
        }
        if let Some(secs) = overrides.cycle_pause_secs {
            self.cycle_pause = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.storage_backoff_secs {
            self.storage_backoff = Duration::from_secs(secs);
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub schedule: BTreeMap<Domain, ScheduleOverrides>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Structural checks that do not depend on the environment.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}`", source.source_id);
            }
            if !is_valid_table_name(&source.table) {
                bail!(
                    "source `{}` has invalid table name `{}`",
                    source.source_id,
                    source.table
                );
            }
            let policy = source.write_policy();
            let allowed = match source.domain {
                Domain::Fire => matches!(policy, WritePolicy::ReplaceAll | WritePolicy::InsertIfAbsent),
                Domain::Earthquake => policy == WritePolicy::InsertIfAbsent,
                Domain::Hazard => policy == WritePolicy::UpsertReplace,
            };
            if !allowed {
                bail!(
                    "source `{}`: write policy {} is not supported for {} feeds",
                    source.source_id,
                    policy.as_str(),
                    source.domain
                );
            }
        }
        Ok(())
    }

    /// Checks that credentials for every enabled source are present.
    pub fn validate_against(&self, config: &SyncConfig) -> Result<()> {
        if config.firms_map_key.is_none() {
            if let Some(source) = self.enabled().find(|s| s.needs_map_key()) {
                bail!(
                    "FIRMS_MAP_KEY is not set but enabled source `{}` requires it",
                    source.source_id
                );
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn enabled_for(&self, domain: Domain) -> Vec<SourceConfig> {
        self.enabled()
            .filter(|s| s.domain == domain)
            .cloned()
            .collect()
    }

    pub fn active_domains(&self) -> Vec<Domain> {
        Domain::ALL
            .into_iter()
            .filter(|d| self.enabled().any(|s| s.domain == *d))
            .collect()
    }

    pub fn timing_for(&self, domain: Domain) -> LoopTiming {
        let base = LoopTiming::default_for(domain);
        match self.schedule.get(&domain) {
            Some(overrides) => base.with_overrides(overrides),
            None => base,
        }
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
