use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use geohaz_core::Domain;
use geohaz_storage::{FeedFetcher, FetchError, FetchResult, FingerprintCache};
use geohaz_sync::{
    DomainLoop, ErrorKind, FailureAction, FixedClock, Ingestor, MemoryStore, SourceError,
    SourceOutcome, SourceRegistry, Store,
};
use tempfile::TempDir;
use tokio::sync::watch;

const VIIRS: &str = include_str!("../../../fixtures/firms/viirs_snpp_nrt.csv");
const MODIS: &str = include_str!("../../../fixtures/firms/modis_nrt.csv");
const QUAKES: &str = include_str!("../../../fixtures/usgs/earthquakes.geojson");
const GDACS: &str = include_str!("../../../fixtures/gdacs/events.json");

const REGISTRY: &str = r#"
sources:
  - source_id: VIIRS_SNPP_NRT
    domain: fire
    endpoint: "https://firms.test/{map_key}/{source}/{area}/1/{date}"
    table: firms_viirs_snpp_nrt
    write_policy: replace_all
  - source_id: MODIS_NRT
    domain: fire
    endpoint: "https://firms.test/{map_key}/{source}/{area}/1/{date}"
    table: firms_modis_nrt
    write_policy: insert_if_absent
  - source_id: usgs
    domain: earthquake
    endpoint: "https://usgs.test/query"
    table: earthquakes
  - source_id: gdacs
    domain: hazard
    endpoint: "https://gdacs.test/events"
    table: gdacs_live
"#;

#[derive(Default)]
struct ScriptedFetcher {
    responses: Mutex<BTreeMap<String, Result<String, u16>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn serve(&self, source_id: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(source_id.to_string(), Ok(body.to_string()));
    }

    fn fail(&self, source_id: &str, status: u16) {
        self.responses
            .lock()
            .unwrap()
            .insert(source_id.to_string(), Err(status));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchResult, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let response = self.responses.lock().unwrap().get(source_id).cloned();
        match response {
            Some(Ok(body)) => Ok(FetchResult::new(source_id, url, body.into_bytes())),
            Some(Err(status)) => Err(FetchError::Remote {
                status,
                url: url.to_string(),
            }),
            None => Err(FetchError::Network {
                url: url.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

struct Harness {
    fetcher: Arc<ScriptedFetcher>,
    store: Arc<MemoryStore>,
    ingestor: Arc<Ingestor>,
    registry: SourceRegistry,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let store = Arc::new(MemoryStore::new());
        let ingestor = Ingestor::new(fetcher.clone(), store.clone() as Arc<dyn Store>)
            .with_url_vars(Some("KEY".to_string()), "60,5,150,55".to_string());
        Self {
            fetcher,
            store,
            ingestor: Arc::new(ingestor),
            registry: SourceRegistry::from_yaml(REGISTRY).unwrap(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn cache(&self, domain: Domain) -> FingerprintCache {
        FingerprintCache::empty(self.dir.path().join(format!("fingerprints-{domain}.json")))
    }

    async fn process(
        &self,
        cache: &mut FingerprintCache,
        source_id: &str,
    ) -> Result<SourceOutcome, SourceError> {
        let source = self.registry.find(source_id).unwrap();
        self.ingestor.process_source(cache, source, poll_date()).await
    }
}

fn poll_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 2).unwrap()
}

fn hazard_doc(modified: &str, description: &str, score: f64) -> String {
    format!(
        r#"{{"features": [{{"properties": {{
            "eventtype": "FL", "eventid": 1102983, "htmldescription": "{description}",
            "alertscore": {score}, "country": "Bangladesh",
            "affectedcountries": [{{"countryname": "Bangladesh"}}],
            "fromdate": "2025-06-01T00:00:00", "todate": "2025-06-12T00:00:00",
            "datemodified": "{modified}", "iscurrent": "true",
            "severitydata": {{"severity": 1, "severitytext": "", "severityunit": ""}},
            "url": {{"geometry": "g", "report": "r"}}
        }}}}]}}"#
    )
}

#[tokio::test]
async fn unchanged_replace_all_payload_skips_the_write() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Fire);
    h.fetcher.serve("VIIRS_SNPP_NRT", VIIRS);

    let first = h.process(&mut cache, "VIIRS_SNPP_NRT").await.unwrap();
    let SourceOutcome::Written { write, parsed, latest_observed_at, .. } = &first else {
        panic!("expected a write, got {first:?}");
    };
    assert_eq!(*parsed, 3);
    assert_eq!(write.inserted, 3);
    assert_eq!(
        *latest_observed_at,
        Utc.with_ymd_and_hms(2025, 3, 2, 5, 43, 0).single()
    );
    let rows_before = h.store.fires("firms_viirs_snpp_nrt").await;

    let second = h.process(&mut cache, "VIIRS_SNPP_NRT").await.unwrap();
    assert_eq!(second, SourceOutcome::Unchanged { hash: first.hash().to_string() });
    assert_eq!(h.store.commits().await, 1);
    assert_eq!(h.store.fires("firms_viirs_snpp_nrt").await, rows_before);

    let reloaded = FingerprintCache::load(cache.path().to_path_buf()).await.unwrap();
    assert_eq!(reloaded.get("VIIRS_SNPP_NRT"), Some(first.hash()));
}

#[tokio::test]
async fn replace_all_reflects_only_the_latest_payload() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Fire);
    h.fetcher.serve("VIIRS_SNPP_NRT", VIIRS);
    h.process(&mut cache, "VIIRS_SNPP_NRT").await.unwrap();

    let single_row: String = VIIRS.lines().take(2).collect::<Vec<_>>().join("\n");
    h.fetcher.serve("VIIRS_SNPP_NRT", &single_row);
    let outcome = h.process(&mut cache, "VIIRS_SNPP_NRT").await.unwrap();
    let SourceOutcome::Written { write, .. } = outcome else {
        panic!("expected a write");
    };
    assert_eq!((write.deleted, write.inserted), (3, 1));

    let rows = h.store.fires("firms_viirs_snpp_nrt").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].latitude, 13.74931);
    assert_eq!(rows[0].longitude, 100.52631);
}

#[tokio::test]
async fn insert_if_absent_stores_each_natural_key_once() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Fire);
    h.fetcher.serve("MODIS_NRT", MODIS);
    h.process(&mut cache, "MODIS_NRT").await.unwrap();

    // Same rows in another order: the gate lets it through and the conflict check drops them.
    let mut lines: Vec<&str> = MODIS.lines().collect();
    lines[1..].reverse();
    h.fetcher.serve("MODIS_NRT", &lines.join("\n"));
    let outcome = h.process(&mut cache, "MODIS_NRT").await.unwrap();
    let SourceOutcome::Written { write, .. } = outcome else {
        panic!("expected a write");
    };
    assert_eq!((write.inserted, write.skipped), (0, 2));
    assert_eq!(h.store.fires("firms_modis_nrt").await.len(), 2);
}

#[tokio::test]
async fn earthquake_feature_is_stored_with_canonical_coordinates_and_time() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Earthquake);
    let single = r#"{"type": "FeatureCollection", "features": [{
        "type": "Feature",
        "properties": {"mag": 5.4, "place": "Off the coast", "time": 1700000000000, "tsunami": 0, "sig": 449, "magType": "mww"},
        "geometry": {"type": "Point", "coordinates": [103.8, 1.35, 10.0]},
        "id": "us1000abcd"
    }]}"#;
    h.fetcher.serve("usgs", single);
    h.process(&mut cache, "usgs").await.unwrap();

    let rows = h.store.earthquakes("earthquakes").await;
    assert_eq!(rows.len(), 1);
    let quake = &rows[0];
    assert_eq!(quake.id, "us1000abcd");
    assert_eq!(quake.mag, Some(5.4));
    assert_eq!(quake.latitude, 1.35);
    assert_eq!(quake.longitude, 103.8);
    assert_eq!(quake.depth, Some(10.0));
    let expected: DateTime<Utc> = "2023-11-14T22:13:20Z".parse().unwrap();
    assert_eq!(quake.time, expected);
}

#[tokio::test]
async fn unparseable_earthquake_feature_is_skipped_not_fatal() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Earthquake);
    h.fetcher.serve("usgs", QUAKES);

    let outcome = h.process(&mut cache, "usgs").await.unwrap();
    let SourceOutcome::Written { skipped_records, write, .. } = outcome else {
        panic!("expected a write");
    };
    assert_eq!(skipped_records, 1);
    assert_eq!(write.inserted, 2);
    let stored = h.store.earthquakes("earthquakes").await;
    assert!(stored.iter().any(|q| q.id == "us7000kxyz" && q.place == "Unknown" && q.tsunami == 1));
}

#[tokio::test]
async fn hazard_revision_b_replaces_revision_a() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Hazard);

    h.fetcher.serve("gdacs", &hazard_doc("2025-06-09T08:00:00", "revision A", 1.0));
    h.process(&mut cache, "gdacs").await.unwrap();

    h.fetcher.serve("gdacs", &hazard_doc("2025-06-11T08:00:00", "revision B", 2.5));
    let outcome = h.process(&mut cache, "gdacs").await.unwrap();
    let SourceOutcome::Written { write, .. } = outcome else {
        panic!("expected a write");
    };
    assert_eq!((write.inserted, write.updated), (0, 1));

    let rows = h.store.hazards("gdacs_live").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].description.as_deref(), Some("revision B"));
    assert_eq!(rows[0].alert_score, Some(2.5));
    assert_eq!(
        rows[0].date_modified,
        Utc.with_ymd_and_hms(2025, 6, 11, 8, 0, 0).single().unwrap()
    );
}

#[tokio::test]
async fn hazard_feed_is_reduced_before_the_upsert() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Hazard);
    h.fetcher.serve("gdacs", GDACS);

    let outcome = h.process(&mut cache, "gdacs").await.unwrap();
    let SourceOutcome::Written { dedup: Some(stats), parsed, .. } = outcome else {
        panic!("expected a hazard write with dedup stats");
    };
    assert_eq!(parsed, 5);
    assert_eq!(stats.superseded, 1);
    assert_eq!(stats.not_current, 1);
    assert_eq!(stats.excluded, 1);

    let rows = h.store.hazards("gdacs_live").await;
    let ids: Vec<i64> = rows.iter().map(|r| r.event_id).collect();
    assert_eq!(ids, vec![1016001, 1102983]);
    let flood = rows.iter().find(|r| r.event_id == 1102983).unwrap();
    assert_eq!(flood.description.as_deref(), Some("Flood in Bangladesh (updated)"));
    assert_eq!(flood.affected_countries, vec!["Bangladesh".to_string()]);
}

#[tokio::test]
async fn failed_write_rolls_back_and_leaves_fingerprint_uncommitted() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Fire);
    h.fetcher.serve("VIIRS_SNPP_NRT", VIIRS);
    let first = h.process(&mut cache, "VIIRS_SNPP_NRT").await.unwrap();

    let single_row: String = VIIRS.lines().take(2).collect::<Vec<_>>().join("\n");
    h.fetcher.serve("VIIRS_SNPP_NRT", &single_row);
    h.store.fail_writes_to("firms_viirs_snpp_nrt").await;

    let err = h.process(&mut cache, "VIIRS_SNPP_NRT").await.expect_err("write fails");
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(err.action(), FailureAction::RetryNextCycle);
    assert_eq!(h.store.fires("firms_viirs_snpp_nrt").await.len(), 3);
    assert_eq!(cache.get("VIIRS_SNPP_NRT"), Some(first.hash()));

    h.store.heal("firms_viirs_snpp_nrt").await;
    let retried = h.process(&mut cache, "VIIRS_SNPP_NRT").await.unwrap();
    assert!(matches!(retried, SourceOutcome::Written { .. }));
    assert_eq!(h.store.fires("firms_viirs_snpp_nrt").await.len(), 1);
}

#[tokio::test]
async fn digest_not_persisted_after_a_write_is_reprocessed_next_cycle() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Earthquake);
    h.fetcher.serve("usgs", QUAKES);

    // A directory where the fingerprint file belongs makes the rename fail.
    std::fs::create_dir_all(cache.path().join("occupied")).unwrap();

    let err = h.process(&mut cache, "usgs").await.expect_err("digest commit fails");
    assert!(matches!(err, SourceError::Fingerprint(_)));
    assert_eq!(err.kind(), ErrorKind::Fingerprint);
    assert_eq!(err.action(), FailureAction::RetryNextCycle);
    assert_eq!(h.store.commits().await, 1);
    assert_eq!(h.store.earthquakes("earthquakes").await.len(), 2);
    assert_eq!(cache.get("usgs"), None);

    std::fs::remove_dir_all(cache.path()).unwrap();
    let retried = h.process(&mut cache, "usgs").await.unwrap();
    let SourceOutcome::Written { write, .. } = &retried else {
        panic!("expected the payload to be reprocessed, got {retried:?}");
    };
    assert_eq!((write.inserted, write.skipped), (0, 2));
    assert_eq!(h.store.commits().await, 2);
    assert_eq!(cache.get("usgs"), Some(retried.hash()));

    let again = h.process(&mut cache, "usgs").await.unwrap();
    assert!(matches!(again, SourceOutcome::Unchanged { .. }));
}

#[tokio::test]
async fn malformed_row_aborts_a_replace_all_batch() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Fire);
    h.fetcher.serve("VIIRS_SNPP_NRT", VIIRS);
    let first = h.process(&mut cache, "VIIRS_SNPP_NRT").await.unwrap();

    let broken = format!("{}\nabc,100.1,330.0,0.39,0.36,2025-03-02,0600,N,VIIRS,n,2.0NRT,290.0,1.0,D\n", VIIRS.trim_end());
    h.fetcher.serve("VIIRS_SNPP_NRT", &broken);
    let err = h.process(&mut cache, "VIIRS_SNPP_NRT").await.expect_err("batch aborted");
    assert_eq!(err.kind(), ErrorKind::Record);
    assert_eq!(err.action(), FailureAction::SkippedThisCycle);
    assert_eq!(h.store.fires("firms_viirs_snpp_nrt").await.len(), 3);
    assert_eq!(h.store.commits().await, 1);
    assert_eq!(cache.get("VIIRS_SNPP_NRT"), Some(first.hash()));
}

#[tokio::test]
async fn unreachable_feed_is_a_network_error() {
    let h = Harness::new();
    let mut cache = h.cache(Domain::Earthquake);
    let err = h.process(&mut cache, "usgs").await.expect_err("nothing scripted");
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(err.action(), FailureAction::RetryNextCycle);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_error_on_one_source_does_not_block_the_next() {
    let h = Harness::new();
    h.fetcher.fail("VIIRS_SNPP_NRT", 503);
    h.fetcher.serve("MODIS_NRT", MODIS);

    let clock = FixedClock(Utc.with_ymd_and_hms(2025, 3, 2, 6, 0, 0).single().unwrap());
    let mut domain_loop = DomainLoop::new(
        Domain::Fire,
        h.registry.enabled_for(Domain::Fire),
        h.registry.timing_for(Domain::Fire),
        h.ingestor.clone(),
        h.cache(Domain::Fire),
        Arc::new(clock),
    );
    let (_tx, mut rx) = watch::channel(false);
    let report = domain_loop.run_cycle(&mut rx).await.unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.written(), 1);
    let failed = report.get("VIIRS_SNPP_NRT").unwrap();
    match &failed.result {
        Err(err) => assert_eq!(err.kind(), ErrorKind::Remote),
        Ok(outcome) => panic!("expected a remote error, got {outcome:?}"),
    }
    assert_eq!(h.store.fires("firms_modis_nrt").await.len(), 2);
    assert!(h.store.fires("firms_viirs_snpp_nrt").await.is_empty());
    assert!(h
        .fetcher
        .calls()
        .contains(&"https://firms.test/KEY/MODIS_NRT/60,5,150,55/1/2025-03-02".to_string()));
    assert!(domain_loop.cache().get("VIIRS_SNPP_NRT").is_none());
    assert!(domain_loop.cache().get("MODIS_NRT").is_some());
}
