use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::{tempdir, TempDir};
use traffic_core::{lookup_selector, RecordKind, SelectorLookup};
use traffic_ingest::BatchIngestor;
use traffic_storage::{CollectionStore, DocumentStore, InMemoryDocumentStore, StoreConfig};
use traffic_sync::{
    IngestPipeline, PersistencePolicy, PresenceReloader, ReloadOutcome, StoreBackend, SyncConfig,
};

const INCIDENTS_2017: &str = "\
INCIDENT INFO,DESCRIPTION,START_DT,MODIFIED_DT,QUADRANT,Longitude,Latitude,location,Count,id
Deerfoot Trail and Glenmore Trail,Two vehicle incident,12/14/2017 08:17:12 AM,12/14/2017 08:45:00 AM,SE,-114.04,51.0,\"(51.0, -114.04)\",2,a1
17 Avenue and 4 Street SW,Stalled vehicle,01/03/2017 11:02:40 PM,01/03/2017 11:30:00 PM,SW,-114.07,51.03,\"(51.03, -114.07)\",1,a2
";

const FLOW_2017: &str = "\
SECNAME,SHAPE_LENG,multilinestring,YEAR_VOL,VOLUME
Macleod Trail,1200.5,MULTILINESTRING ((-114.06 51.0)),2017,24000
Bow Trail,830.25,MULTILINESTRING ((-114.1 51.04)),2017,9000
Crowchild Trail,990.0,MULTILINESTRING ((-114.13 51.06)),2017,15500
";

const FLOW_2016: &str = "\
SECNAME,SHAPE_LENG,multilinestring,YEAR_VOL,VOLUME
Memorial Drive,640.0,MULTILINESTRING ((-114.09 51.05)),2016,18000
";

fn source_dir() -> TempDir {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("2017_Incidents.csv"), INCIDENTS_2017).unwrap();
    fs::write(dir.path().join("2017_Traffic_Flow.csv"), FLOW_2017).unwrap();
    fs::write(dir.path().join("readme.txt"), "not data").unwrap();
    dir
}

fn reloader(source: &Path, backend: Arc<InMemoryDocumentStore>) -> PresenceReloader {
    reloader_with_policy(source, backend, PersistencePolicy::default())
}

fn reloader_with_policy(
    source: &Path,
    backend: Arc<InMemoryDocumentStore>,
    policy: PersistencePolicy,
) -> PresenceReloader {
    let store = CollectionStore::new(backend, StoreConfig::default());
    PresenceReloader::new(IngestPipeline::new(
        source,
        BatchIngestor::default(),
        store,
        policy,
    ))
}

#[tokio::test]
async fn missing_collection_wipes_managed_databases_and_reingests() {
    let source = source_dir();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let reloader = reloader(source.path(), backend.clone());
    reloader.store().create_collection("db_volume", "stale").await.unwrap();
    reloader.store().create_collection("db_unrelated", "keep").await.unwrap();

    let outcome = reloader.ensure("2017_traffic_volume_flow").await.unwrap();

    let ReloadOutcome::Reloaded(summary) = outcome else {
        panic!("expected a plain reload, got {outcome:?}");
    };
    assert_eq!(summary.volume_rows, 3);
    assert_eq!(summary.incident_rows, 2);
    assert_eq!(summary.skipped, vec!["readme.txt".to_string()]);

    let volume = backend.list_collections("db_volume").await.unwrap();
    assert_eq!(volume, vec!["2017_traffic_volume_flow".to_string(), "all_volumes".to_string()]);
    let incident = backend.list_collections("db_incident").await.unwrap();
    assert_eq!(incident, vec!["2017_traffic_incidents".to_string(), "all_incidents".to_string()]);
    assert_eq!(
        backend.list_collections("db_unrelated").await.unwrap(),
        vec!["keep".to_string()]
    );
}

#[tokio::test]
async fn present_collection_is_left_alone() {
    let source = source_dir();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let reloader = reloader(source.path(), backend.clone());
    reloader.store().create_collection("db_incident", "all_incidents").await.unwrap();
    reloader.store().create_collection("db_volume", "marker").await.unwrap();

    let outcome = reloader.ensure("all_incidents").await.unwrap();

    assert!(matches!(outcome, ReloadOutcome::Present));
    assert!(!outcome.reloaded());
    assert!(backend
        .list_collections("db_volume")
        .await
        .unwrap()
        .contains(&"marker".to_string()));
}

#[tokio::test]
async fn absent_year_is_marked_and_does_not_reload_again() {
    let source = source_dir();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let reloader = reloader(source.path(), backend.clone());

    let first = reloader.ensure("2016_traffic_volume_flow").await.unwrap();
    assert!(matches!(first, ReloadOutcome::ReloadedKnownAbsent(_)));
    assert!(backend
        .list_collections("db_incident")
        .await
        .unwrap()
        .contains(&"2016_traffic_volume_flow".to_string()));

    let second = reloader.ensure("2016_traffic_volume_flow").await.unwrap();
    assert!(matches!(second, ReloadOutcome::Present));
}

#[tokio::test]
async fn without_marking_every_miss_reloads() {
    let source = source_dir();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let reloader = reloader(source.path(), backend).with_known_absent_marking(false);

    for _ in 0..2 {
        let outcome = reloader.ensure("2016_traffic_volume_flow").await.unwrap();
        assert!(matches!(outcome, ReloadOutcome::Reloaded(_)));
    }
}

#[tokio::test]
async fn volume_persistence_can_be_disabled() {
    let source = source_dir();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let reloader = reloader_with_policy(
        source.path(),
        backend.clone(),
        PersistencePolicy {
            persist_volume: false,
            partition_by_year: false,
            ..Default::default()
        },
    );

    let summary = reloader.pipeline().run_once().await.unwrap();

    assert_eq!(summary.volume_rows, 3);
    assert_eq!(summary.collections.len(), 1);
    assert_eq!(summary.collections[0].collection, "all_incidents");
    assert!(backend.list_collections("db_volume").await.unwrap().is_empty());
}

#[tokio::test]
async fn selector_read_path_filters_and_sorts() {
    let source = source_dir();
    let reloader = reloader(source.path(), Arc::new(InMemoryDocumentStore::new()));

    let SelectorLookup::Mapped(target) = lookup_selector("volume", 2017) else {
        panic!("volume/2017 should be mapped");
    };
    let table = reloader
        .fetch_year_sorted(&target, RecordKind::Volume, 2017)
        .await
        .unwrap();

    assert_eq!(table.columns().len(), 5);
    assert!(!table.has_column("_id"));
    let volumes: Vec<_> = (0..table.len())
        .map(|row| table.cell(row, "volume").cloned().unwrap())
        .collect();
    assert_eq!(volumes, vec![json!(9000), json!(15500), json!(24000)]);
}

#[tokio::test]
async fn reimport_replaces_instead_of_appending() {
    let source = source_dir();
    let reloader = reloader(source.path(), Arc::new(InMemoryDocumentStore::new()));

    reloader.pipeline().run_once().await.unwrap();
    reloader.pipeline().run_once().await.unwrap();

    let all = reloader.store().fetch_all("db_incident", "all_incidents").await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn year_removed_from_sources_drops_its_collection() {
    let source = source_dir();
    fs::write(source.path().join("2016_Traffic_Flow.csv"), FLOW_2016).unwrap();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let reloader = reloader(source.path(), backend.clone());
    reloader.pipeline().run_once().await.unwrap();
    assert_eq!(
        backend.list_collections("db_volume").await.unwrap(),
        vec![
            "2016_traffic_volume_flow".to_string(),
            "2017_traffic_volume_flow".to_string(),
            "all_volumes".to_string(),
        ]
    );

    fs::remove_file(source.path().join("2017_Traffic_Flow.csv")).unwrap();
    let summary = reloader.pipeline().run_once().await.unwrap();

    assert_eq!(summary.pruned, vec!["db_volume.2017_traffic_volume_flow".to_string()]);
    assert_eq!(
        backend.list_collections("db_volume").await.unwrap(),
        vec!["2016_traffic_volume_flow".to_string(), "all_volumes".to_string()]
    );
    let all = reloader.store().fetch_all("db_volume", "all_volumes").await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(backend
        .list_collections("db_incident")
        .await
        .unwrap()
        .contains(&"2017_traffic_incidents".to_string()));
}

#[tokio::test]
async fn disabling_partitions_drops_existing_year_collections() {
    let source = source_dir();
    let backend = Arc::new(InMemoryDocumentStore::new());
    reloader(source.path(), backend.clone())
        .pipeline()
        .run_once()
        .await
        .unwrap();

    let unpartitioned = reloader_with_policy(
        source.path(),
        backend.clone(),
        PersistencePolicy {
            partition_by_year: false,
            ..Default::default()
        },
    );
    let summary = unpartitioned.pipeline().run_once().await.unwrap();

    assert_eq!(summary.pruned.len(), 2);
    assert_eq!(
        backend.list_collections("db_volume").await.unwrap(),
        vec!["all_volumes".to_string()]
    );
    assert_eq!(
        backend.list_collections("db_incident").await.unwrap(),
        vec!["all_incidents".to_string()]
    );
}

#[tokio::test]
async fn malformed_source_surfaces_the_error() {
    let source = source_dir();
    fs::write(
        source.path().join("2018_Incidents.csv"),
        "START_DT,Count\n2018-06-21 17:45,1\n",
    )
    .unwrap();
    let reloader = reloader(source.path(), Arc::new(InMemoryDocumentStore::new()));

    let err = reloader.ensure("all_incidents").await.unwrap_err();
    assert!(format!("{err:#}").contains("2018-06-21 17:45"));
}

#[tokio::test]
async fn file_backend_end_to_end_from_config() {
    let source = source_dir();
    let data = tempdir().expect("tempdir");
    let config = SyncConfig {
        source_dir: source.path().to_path_buf(),
        backend: StoreBackend::File,
        data_dir: data.path().to_path_buf(),
        ..Default::default()
    };

    let reloader = PresenceReloader::from_config(&config).unwrap();
    let table = reloader.fetch("db_incident", "all_incidents").await.unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.cell(1, "year"), Some(&json!(2017)));

    let reopened = PresenceReloader::from_config(&config).unwrap();
    assert!(matches!(
        reopened.ensure("all_incidents").await.unwrap(),
        ReloadOutcome::Present
    ));
    assert!(data
        .path()
        .join("localhost_27017/db_volume/2017_traffic_volume_flow.json")
        .exists());
}
