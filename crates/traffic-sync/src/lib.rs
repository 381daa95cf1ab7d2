//! Ingest-and-persist pipeline plus the presence-triggered reloader.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use traffic_core::{CollectionRef, RecordKind, Table, INCIDENT_DATABASE, VOLUME_DATABASE};
use traffic_ingest::{BatchIngestor, KeywordClassifier, SourceStat, UnifiedTables};
use traffic_storage::{
    CollectionStore, DocumentStore, FileDocumentStore, ImportReceipt, InMemoryDocumentStore,
    StoreAddress, StoreConfig,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "traffic-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    File,
    Memory,
}

/// Which unified tables get written, and whether per-year collections are
/// written alongside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
    pub persist_volume: bool,
    pub persist_incident: bool,
    pub partition_by_year: bool,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            persist_volume: true,
            persist_incident: true,
            partition_by_year: true,
        }
    }
}

impl PersistencePolicy {
    pub fn persists(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Volume => self.persist_volume,
            RecordKind::Incident => self.persist_incident,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_dir: PathBuf,
    pub backend: StoreBackend,
    pub data_dir: PathBuf,
    pub store: StoreConfig,
    pub persistence: PersistencePolicy,
    pub mark_known_absent: bool,
    pub classifier_rules: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("./csv"),
            backend: StoreBackend::File,
            data_dir: PathBuf::from("./data"),
            store: StoreConfig::default(),
            persistence: PersistencePolicy::default(),
            mark_known_absent: true,
            classifier_rules: None,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let address = StoreAddress {
            host: std::env::var("TRAFFIC_STORE_HOST").unwrap_or(defaults.store.address.host),
            port: std::env::var("TRAFFIC_STORE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.store.address.port),
        };
        let managed_databases = std::env::var("TRAFFIC_MANAGED_DATABASES")
            .map(|v| parse_list(&v))
            .ok()
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.store.managed_databases);

        Self {
            source_dir: std::env::var("TRAFFIC_SOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_dir),
            backend: match std::env::var("TRAFFIC_STORE_BACKEND").as_deref() {
                Ok("memory") => StoreBackend::Memory,
                _ => StoreBackend::File,
            },
            data_dir: std::env::var("TRAFFIC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            store: StoreConfig {
                address,
                managed_databases,
            },
            persistence: PersistencePolicy {
                persist_volume: env_flag("TRAFFIC_PERSIST_VOLUME", true),
                persist_incident: env_flag("TRAFFIC_PERSIST_INCIDENT", true),
                partition_by_year: env_flag("TRAFFIC_PARTITION_BY_YEAR", true),
            },
            mark_known_absent: env_flag("TRAFFIC_MARK_KNOWN_ABSENT", true),
            classifier_rules: std::env::var("TRAFFIC_CLASSIFIER_RULES").ok().map(PathBuf::from),
        }
    }

    pub fn open_store(&self) -> CollectionStore {
        let backend: Arc<dyn DocumentStore> = match self.backend {
            StoreBackend::File => {
                Arc::new(FileDocumentStore::new(&self.data_dir, &self.store.address))
            }
            StoreBackend::Memory => Arc::new(InMemoryDocumentStore::new()),
        };
        CollectionStore::new(backend, self.store.clone())
    }

    pub fn build_ingestor(&self) -> Result<BatchIngestor> {
        let classifier = match &self.classifier_rules {
            Some(path) => KeywordClassifier::from_yaml_file(path)?,
            None => KeywordClassifier::default(),
        };
        Ok(BatchIngestor::new(Box::new(classifier)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenCollection {
    pub database: String,
    pub collection: String,
    pub documents: usize,
    pub content_hash: String,
}

impl From<ImportReceipt> for WrittenCollection {
    fn from(receipt: ImportReceipt) -> Self {
        Self {
            database: receipt.database,
            collection: receipt.collection,
            documents: receipt.documents,
            content_hash: receipt.content_hash,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceStat>,
    pub skipped: Vec<String>,
    pub volume_rows: usize,
    pub incident_rows: usize,
    pub collections: Vec<WrittenCollection>,
    /// Per-year collections dropped because their year left the sources.
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistOutcome {
    pub written: Vec<WrittenCollection>,
    pub pruned: Vec<String>,
}

pub struct IngestPipeline {
    source_dir: PathBuf,
    ingestor: BatchIngestor,
    store: CollectionStore,
    persistence: PersistencePolicy,
}

impl IngestPipeline {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        ingestor: BatchIngestor,
        store: CollectionStore,
        persistence: PersistencePolicy,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            ingestor,
            store,
            persistence,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self::new(
            config.source_dir.clone(),
            config.build_ingestor()?,
            config.open_store(),
            config.persistence,
        ))
    }

    pub fn store(&self) -> &CollectionStore {
        &self.store
    }

    /// Ingests the source directory and replaces every persisted collection
    /// the policy covers.
    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source_dir = %self.source_dir.display());

        async {
            let outcome = self
                .ingestor
                .ingest_dir(&self.source_dir)
                .with_context(|| format!("ingesting {}", self.source_dir.display()))?;
            let persisted = self.persist(&outcome.tables).await?;

            Ok::<_, anyhow::Error>(IngestRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                volume_rows: outcome.tables.volume.len(),
                incident_rows: outcome.tables.incident.len(),
                sources: outcome.sources,
                skipped: outcome.skipped,
                collections: persisted.written,
                pruned: persisted.pruned,
            })
        }
        .instrument(span)
        .await
    }

    /// Replaces the unified collection of every persisted kind and, when
    /// partitioning, one collection per distinct year. Per-year collections
    /// of a persisted kind whose year is no longer in the table are dropped.
    pub async fn persist(&self, tables: &UnifiedTables) -> Result<PersistOutcome> {
        let mut outcome = PersistOutcome::default();
        for kind in RecordKind::ALL {
            if !self.persistence.persists(kind) {
                debug!(%kind, "persistence disabled for kind");
                continue;
            }
            let table = tables.get(kind);
            let database = kind.database();
            outcome
                .written
                .push(self.import(table, database, kind.unified_collection()).await?);

            let years = if self.persistence.partition_by_year {
                table.distinct_years()
            } else {
                Vec::new()
            };
            outcome.pruned.extend(self.prune_years(kind, &years).await?);
            for year in years {
                let slice = table.filter_by_year(year);
                outcome
                    .written
                    .push(self.import(&slice, database, &kind.year_collection(year)).await?);
            }
        }
        Ok(outcome)
    }

    async fn prune_years(&self, kind: RecordKind, keep: &[i64]) -> Result<Vec<String>> {
        let database = kind.database();
        let existing = self
            .store
            .list_collections(database)
            .await
            .with_context(|| format!("listing collections of {database}"))?;

        let mut pruned = Vec::new();
        for collection in existing {
            let Some(year) = kind.year_of_collection(&collection) else {
                continue;
            };
            if keep.contains(&year) {
                continue;
            }
            self.store
                .drop(database, &collection)
                .await
                .with_context(|| format!("dropping {database}.{collection}"))?;
            info!(database, collection = %collection, "stale year collection dropped");
            pruned.push(format!("{database}.{collection}"));
        }
        Ok(pruned)
    }

    async fn import(
        &self,
        table: &Table,
        database: &str,
        collection: &str,
    ) -> Result<WrittenCollection> {
        let receipt = self
            .store
            .replace_import(table, database, collection)
            .await
            .with_context(|| format!("importing {database}.{collection}"))?;
        Ok(receipt.into())
    }
}

/// How a presence check settled.
#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    /// Found in a candidate database; nothing was touched.
    Present,
    /// Absent everywhere; managed databases were wiped and re-ingested.
    Reloaded(IngestRunSummary),
    /// Reloaded, still absent, and now marked with an empty collection so
    /// later checks settle without another wipe.
    ReloadedKnownAbsent(IngestRunSummary),
}

impl ReloadOutcome {
    pub fn reloaded(&self) -> bool {
        !matches!(self, ReloadOutcome::Present)
    }
}

/// Guards reads with a presence check that rebuilds every managed
/// database when the requested collection is missing from all candidates.
///
/// Each call goes CHECKING -> STABLE. Only absence is detected, never
/// staleness.
pub struct PresenceReloader {
    pipeline: IngestPipeline,
    candidates: Vec<String>,
    mark_known_absent: bool,
}

impl PresenceReloader {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self {
            pipeline,
            candidates: vec![INCIDENT_DATABASE.to_string(), VOLUME_DATABASE.to_string()],
            mark_known_absent: true,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self::new(IngestPipeline::from_config(config)?)
            .with_known_absent_marking(config.mark_known_absent))
    }

    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_known_absent_marking(mut self, enabled: bool) -> Self {
        self.mark_known_absent = enabled;
        self
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &CollectionStore {
        self.pipeline.store()
    }

    async fn present(&self, collection: &str) -> Result<bool> {
        let candidates: Vec<&str> = self.candidates.iter().map(String::as_str).collect();
        self.store()
            .exists(collection, &candidates)
            .await
            .with_context(|| format!("checking presence of {collection}"))
    }

    pub async fn ensure(&self, collection: &str) -> Result<ReloadOutcome> {
        if self.present(collection).await? {
            debug!(collection, "collection present");
            return Ok(ReloadOutcome::Present);
        }

        warn!(collection, "collection not found; reloading ingestion");
        let dropped = self
            .store()
            .drop_all_managed()
            .await
            .context("dropping managed databases")?;
        info!(dropped = dropped.len(), "managed databases cleared");
        let summary = self.pipeline.run_once().await?;

        if !self.mark_known_absent || self.present(collection).await? {
            return Ok(ReloadOutcome::Reloaded(summary));
        }
        let Some(database) = self.candidates.first() else {
            return Ok(ReloadOutcome::Reloaded(summary));
        };
        self.store()
            .create_collection(database, collection)
            .await
            .with_context(|| format!("marking {database}.{collection} as known-absent"))?;
        info!(database = %database, collection, "collection marked known-absent");
        Ok(ReloadOutcome::ReloadedKnownAbsent(summary))
    }

    /// Presence-guarded read of a whole collection.
    pub async fn fetch(&self, database: &str, collection: &str) -> Result<Table> {
        self.ensure(collection).await?;
        self.store()
            .fetch_all(database, collection)
            .await
            .with_context(|| format!("fetching {database}.{collection}"))
    }

    /// Guarded read of a selector target, narrowed to `year` and sorted on
    /// the kind's key.
    pub async fn fetch_year_sorted(
        &self,
        target: &CollectionRef,
        kind: RecordKind,
        year: i64,
    ) -> Result<Table> {
        let mut table = self
            .fetch(&target.database, &target.collection)
            .await?
            .filter_by_year(year);
        table.sort_by(kind);
        Ok(table)
    }
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = SyncConfig::from_env();
    IngestPipeline::from_config(&config)?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_common_spellings() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("True"), Some(true));
        assert_eq!(parse_flag(" false "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn lists_drop_blank_entries() {
        assert_eq!(
            parse_list("db_volume, db_incident,,"),
            vec!["db_volume".to_string(), "db_incident".to_string()]
        );
    }

    #[test]
    fn policy_is_explicit_per_kind() {
        let policy = PersistencePolicy {
            persist_volume: false,
            ..Default::default()
        };
        assert!(!policy.persists(RecordKind::Volume));
        assert!(policy.persists(RecordKind::Incident));
    }

    #[test]
    fn default_config_manages_both_databases() {
        let config = SyncConfig::default();
        assert_eq!(
            config.store.managed_databases,
            vec!["db_volume".to_string(), "db_incident".to_string()]
        );
        assert_eq!(config.store.address.port, 27017);
        assert!(config.mark_known_absent);
    }
}
