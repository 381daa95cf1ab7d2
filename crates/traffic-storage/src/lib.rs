//! Document store seam + collection adapter with full-replace imports.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use traffic_core::{Table, INCIDENT_DATABASE, VOLUME_DATABASE};
use uuid::Uuid;

pub const CRATE_NAME: &str = "traffic-storage";

/// Storage-assigned identity field, stripped on every read.
pub const ID_FIELD: &str = "_id";

pub type Document = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable during {operation}: {source}")]
    Unavailable {
        operation: String,
        #[source]
        source: std::io::Error,
    },
    #[error("collection {database}.{collection} is not readable: {source}")]
    Corrupt {
        database: String,
        collection: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid database or collection name {0:?}")]
    InvalidName(String),
    #[error("insert into {database}.{collection} failed after delete; collection left empty: {source}")]
    PartialReplace {
        database: String,
        collection: String,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    fn unavailable(operation: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Unavailable {
            operation: operation.into(),
            source,
        }
    }
}

/// Minimal document-store contract: named databases holding named
/// collections of flat documents.
///
/// Inserting into a missing collection creates it; deleting from or
/// dropping a missing one is a no-op.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError>;

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError>;

    async fn create_collection(&self, database: &str, collection: &str) -> Result<(), StoreError>;

    async fn find(
        &self,
        database: &str,
        collection: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Inserts documents, assigning an [`ID_FIELD`] to any that lack one.
    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<usize, StoreError>;

    async fn delete_many(&self, database: &str, collection: &str) -> Result<usize, StoreError>;

    async fn drop_collection(&self, database: &str, collection: &str) -> Result<(), StoreError>;

    async fn drop_database(&self, database: &str) -> Result<(), StoreError>;
}

fn assign_ids(documents: &mut [Document]) {
    for doc in documents {
        if !doc.contains_key(ID_FIELD) {
            // keep the identity first, the way stores echo documents back
            let mut stamped = Document::new();
            stamped.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().to_string()));
            stamped.append(doc);
            *doc = stamped;
        }
    }
}

type Databases = BTreeMap<String, BTreeMap<String, Vec<Document>>>;

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    databases: Mutex<Databases>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.databases.lock().await.keys().cloned().collect())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let dbs = self.databases.lock().await;
        Ok(dbs
            .get(database)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_collection(&self, database: &str, collection: &str) -> Result<(), StoreError> {
        let mut dbs = self.databases.lock().await;
        dbs.entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let dbs = self.databases.lock().await;
        let docs = dbs.get(database).and_then(|colls| colls.get(collection));
        Ok(docs
            .map(|d| d.iter().take(limit.unwrap_or(usize::MAX)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        mut documents: Vec<Document>,
    ) -> Result<usize, StoreError> {
        assign_ids(&mut documents);
        let count = documents.len();
        let mut dbs = self.databases.lock().await;
        dbs.entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
        Ok(count)
    }

    async fn delete_many(&self, database: &str, collection: &str) -> Result<usize, StoreError> {
        let mut dbs = self.databases.lock().await;
        let docs = dbs.get_mut(database).and_then(|colls| colls.get_mut(collection));
        Ok(docs.map(|d| d.drain(..).count()).unwrap_or(0))
    }

    async fn drop_collection(&self, database: &str, collection: &str) -> Result<(), StoreError> {
        let mut dbs = self.databases.lock().await;
        if let Some(colls) = dbs.get_mut(database) {
            colls.remove(collection);
            if colls.is_empty() {
                dbs.remove(database);
            }
        }
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<(), StoreError> {
        self.databases.lock().await.remove(database);
        Ok(())
    }
}

/// Host/port pair identifying one store instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAddress {
    pub host: String,
    pub port: u16,
}

impl Default for StoreAddress {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
        }
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// File-backed store: `<root>/<host>_<port>/<database>/<collection>.json`,
/// each collection a JSON array rewritten atomically on every change.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(data_dir: impl AsRef<Path>, address: &StoreAddress) -> Self {
        Self {
            root: data_dir
                .as_ref()
                .join(format!("{}_{}", address.host, address.port)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn database_dir(&self, database: &str) -> Result<PathBuf, StoreError> {
        validate_name(database)?;
        Ok(self.root.join(database))
    }

    fn collection_path(&self, database: &str, collection: &str) -> Result<PathBuf, StoreError> {
        validate_name(collection)?;
        Ok(self.database_dir(database)?.join(format!("{collection}.json")))
    }

    async fn read_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Option<Vec<Document>>, StoreError> {
        let path = self.collection_path(database, collection)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::unavailable(
                    format!("reading {}", path.display()),
                    err,
                ))
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                database: database.to_string(),
                collection: collection.to_string(),
                source,
            })
    }

    async fn write_collection(
        &self,
        database: &str,
        collection: &str,
        documents: &[Document],
    ) -> Result<(), StoreError> {
        let path = self.collection_path(database, collection)?;
        let bytes = serde_json::to_vec(documents).map_err(|source| StoreError::Corrupt {
            database: database.to_string(),
            collection: collection.to_string(),
            source,
        })?;
        write_atomic(&path, &bytes).await
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(StoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Writes through a temp file in the same directory, then renames.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Err(StoreError::InvalidName(path.display().to_string()));
    };
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::unavailable(format!("creating {}", parent.display()), e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::unavailable(
            format!("writing {}", path.display()),
            err,
        ));
    }
    Ok(())
}

async fn list_dir(
    dir: &Path,
    want_dirs: bool,
) -> Result<Vec<String>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(StoreError::unavailable(
                format!("listing {}", dir.display()),
                err,
            ))
        }
    };
    let mut names = Vec::new();
    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::unavailable(format!("listing {}", dir.display()), e))?;
        let Some(entry) = entry else {
            break;
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry
            .file_type()
            .await
            .map(|ft| ft.is_dir())
            .unwrap_or(false);
        if want_dirs && is_dir {
            names.push(name);
        } else if !want_dirs && !is_dir {
            if let Some(stem) = name.strip_suffix(".json") {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        list_dir(&self.root, true).await
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        list_dir(&self.database_dir(database)?, false).await
    }

    async fn create_collection(&self, database: &str, collection: &str) -> Result<(), StoreError> {
        if self.read_collection(database, collection).await?.is_none() {
            self.write_collection(database, collection, &[]).await?;
        }
        Ok(())
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let mut docs = self
            .read_collection(database, collection)
            .await?
            .unwrap_or_default();
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        mut documents: Vec<Document>,
    ) -> Result<usize, StoreError> {
        assign_ids(&mut documents);
        let count = documents.len();
        let mut existing = self
            .read_collection(database, collection)
            .await?
            .unwrap_or_default();
        existing.extend(documents);
        self.write_collection(database, collection, &existing).await?;
        Ok(count)
    }

    async fn delete_many(&self, database: &str, collection: &str) -> Result<usize, StoreError> {
        match self.read_collection(database, collection).await? {
            Some(existing) => {
                self.write_collection(database, collection, &[]).await?;
                Ok(existing.len())
            }
            None => Ok(0),
        }
    }

    async fn drop_collection(&self, database: &str, collection: &str) -> Result<(), StoreError> {
        let path = self.collection_path(database, collection)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(StoreError::unavailable(
                    format!("removing {}", path.display()),
                    err,
                ))
            }
        }
        let db_dir = self.database_dir(database)?;
        if list_dir(&db_dir, false).await?.is_empty() {
            // a database with no collections no longer exists
            let _ = fs::remove_dir_all(&db_dir).await;
        }
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<(), StoreError> {
        let dir = self.database_dir(database)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::unavailable(
                format!("removing {}", dir.display()),
                err,
            )),
        }
    }
}

/// Explicit connection settings for a [`CollectionStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub address: StoreAddress,
    /// Databases owned by this system; the only ones `drop_all_managed` touches.
    pub managed_databases: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: StoreAddress::default(),
            managed_databases: vec![VOLUME_DATABASE.to_string(), INCIDENT_DATABASE.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReceipt {
    pub database: String,
    pub collection: String,
    pub documents: usize,
    pub content_hash: String,
}

/// Create/replace/query/drop operations over one document store.
#[derive(Clone)]
pub struct CollectionStore {
    backend: Arc<dyn DocumentStore>,
    config: StoreConfig,
}

impl fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CollectionStore {
    pub fn new(backend: Arc<dyn DocumentStore>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_managed(&self, database: &str) -> bool {
        self.config.managed_databases.iter().any(|d| d == database)
    }

    pub fn content_hash(documents: &[Document]) -> String {
        let mut hasher = Sha256::new();
        for doc in documents {
            // Map serialization cannot fail for JSON values.
            hasher.update(serde_json::to_vec(doc).unwrap_or_default());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Deletes every document in the collection, then inserts one document
    /// per table row. Not transactional: a failed insert leaves the
    /// collection empty and is reported as [`StoreError::PartialReplace`].
    pub async fn replace_import(
        &self,
        table: &Table,
        database: &str,
        collection: &str,
    ) -> Result<ImportReceipt, StoreError> {
        let span = info_span!(
            "replace_import",
            store = %self.config.address,
            database,
            collection
        );
        async {
            let documents = table.to_documents();
            let content_hash = Self::content_hash(&documents);

            let deleted = self.backend.delete_many(database, collection).await?;
            debug!(deleted, "cleared collection");

            let inserted = if documents.is_empty() {
                self.backend.create_collection(database, collection).await?;
                0
            } else {
                self.backend
                    .insert_many(database, collection, documents)
                    .await
                    .map_err(|source| StoreError::PartialReplace {
                        database: database.to_string(),
                        collection: collection.to_string(),
                        source: Box::new(source),
                    })?
            };
            info!(inserted, "collection imported");

            Ok::<_, StoreError>(ImportReceipt {
                database: database.to_string(),
                collection: collection.to_string(),
                documents: inserted,
                content_hash,
            })
        }
        .instrument(span)
        .await
    }

    /// Every document in the collection as a table, identity field removed.
    pub async fn fetch_all(&self, database: &str, collection: &str) -> Result<Table, StoreError> {
        let docs = self.backend.find(database, collection, None).await?;
        Ok(Table::from_documents(docs, &[ID_FIELD]))
    }

    /// First `limit` documents, for quick inspection.
    pub async fn preview(
        &self,
        database: &str,
        collection: &str,
        limit: usize,
    ) -> Result<Table, StoreError> {
        let docs = self.backend.find(database, collection, Some(limit)).await?;
        Ok(Table::from_documents(docs, &[ID_FIELD]))
    }

    pub async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        self.backend.list_collections(database).await
    }

    pub async fn exists(&self, collection: &str, candidates: &[&str]) -> Result<bool, StoreError> {
        for database in candidates {
            let collections = self.backend.list_collections(database).await?;
            if collections.iter().any(|c| c == collection) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn create_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<(), StoreError> {
        self.backend.create_collection(database, collection).await
    }

    /// Drops the collection if present. Returns whether it existed.
    pub async fn drop(&self, database: &str, collection: &str) -> Result<bool, StoreError> {
        let present = self
            .backend
            .list_collections(database)
            .await?
            .iter()
            .any(|c| c == collection);
        if present {
            self.backend.drop_collection(database, collection).await?;
            info!(database, collection, "collection dropped");
        } else {
            debug!(database, collection, "collection absent; nothing to drop");
        }
        Ok(present)
    }

    /// Drops every existing database named in the managed registry.
    pub async fn drop_all_managed(&self) -> Result<Vec<String>, StoreError> {
        let existing = self.backend.list_databases().await?;
        let mut dropped = Vec::new();
        for database in existing.iter().filter(|d| self.is_managed(d)) {
            self.backend.drop_database(database).await?;
            warn!(database = %database, "managed database dropped");
            dropped.push(database.clone());
        }
        Ok(dropped)
    }
}
