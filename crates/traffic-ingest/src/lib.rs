//! CSV record sources, per-kind schema normalization, and batch ingestion.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use traffic_core::{
    parse_column, RecordKind, Row, Table, INCIDENT_COLUMNS, VOLUME_COLUMNS, YEAR_COLUMN,
};

pub const CRATE_NAME: &str = "traffic-ingest";

/// `start_dt` layout in incident exports, e.g. `12/14/2017 08:17:12 AM`.
pub const INCIDENT_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

const START_DT_COLUMN: &str = "start_dt";

/// Legacy volume headers and their canonical names.
const VOLUME_ALIASES: [(&str, &str); 4] = [
    ("secname", "segment_name"),
    ("shape_leng", "length_m"),
    ("multilinestring", "the_geom"),
    ("year_vol", "year"),
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing required column {column:?}")]
    MissingColumn { column: &'static str },
    #[error("row {row}: start_dt {value:?} does not match {layout:?}", layout = INCIDENT_TIMESTAMP_FORMAT)]
    MalformedDate { row: usize, value: String },
}

/// Calendar year of an incident `start_dt` value.
pub fn incident_year(start_dt: &str) -> Option<i32> {
    NaiveDateTime::parse_from_str(start_dt, INCIDENT_TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.year())
}

/// Reads one delimited file into a table with the headers exactly as
/// written. Cells are typed per column (see [`parse_column`]); short
/// records are null-padded and cells beyond the header are dropped.
pub fn read_record_source(path: impl AsRef<Path>) -> Result<Table> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("reading headers of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let width = headers.len();

    let mut records = Vec::new();
    let mut overlong = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("reading {} record {}", path.display(), line + 1))?;
        if record.len() > width {
            overlong += 1;
        }
        records.push(record);
    }
    if overlong > 0 {
        debug!(
            path = %path.display(),
            records = overlong,
            "dropped cells beyond the header width"
        );
    }

    let mut rows: Vec<Row> = vec![Vec::with_capacity(width); records.len()];
    for idx in 0..width {
        let cells: Vec<&str> = records
            .iter()
            .map(|record| record.get(idx).unwrap_or(""))
            .collect();
        for (row, value) in rows.iter_mut().zip(parse_column(&cells)) {
            row.push(value);
        }
    }
    Ok(Table::from_rows(headers, rows))
}

/// Per-kind mapping from an arbitrary raw table onto the canonical shape.
pub trait SchemaNormalizer: Send + Sync {
    fn kind(&self) -> RecordKind;

    fn normalize(&self, raw: Table) -> Result<Table, NormalizeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeNormalizer;

impl SchemaNormalizer for VolumeNormalizer {
    fn kind(&self) -> RecordKind {
        RecordKind::Volume
    }

    fn normalize(&self, mut raw: Table) -> Result<Table, NormalizeError> {
        raw.lowercase_columns();
        for (legacy, canonical) in VOLUME_ALIASES {
            raw.rename_column(legacy, canonical);
        }
        Ok(raw.project(&VOLUME_COLUMNS))
    }
}

/// Incident normalization. The `year` column is always derived from
/// `start_dt`; any row that fails to parse fails the whole source.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncidentNormalizer;

impl SchemaNormalizer for IncidentNormalizer {
    fn kind(&self) -> RecordKind {
        RecordKind::Incident
    }

    fn normalize(&self, mut raw: Table) -> Result<Table, NormalizeError> {
        raw.lowercase_columns();
        raw.drop_column("id");
        raw.rename_column("incident info", "incident_info");

        let starts = raw
            .column_values(START_DT_COLUMN)
            .ok_or(NormalizeError::MissingColumn {
                column: START_DT_COLUMN,
            })?;
        let years = starts
            .into_iter()
            .enumerate()
            .map(|(row, value)| {
                let year = match value {
                    Value::String(text) => incident_year(text),
                    _ => None,
                };
                year.map(|y| Value::from(i64::from(y)))
                    .ok_or_else(|| NormalizeError::MalformedDate {
                        row,
                        value: match value {
                            Value::String(text) => text.clone(),
                            other => other.to_string(),
                        },
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        raw.set_column(YEAR_COLUMN, years);

        Ok(raw.project(&INCIDENT_COLUMNS))
    }
}

static VOLUME_NORMALIZER: VolumeNormalizer = VolumeNormalizer;
static INCIDENT_NORMALIZER: IncidentNormalizer = IncidentNormalizer;

pub fn normalizer_for(kind: RecordKind) -> &'static dyn SchemaNormalizer {
    match kind {
        RecordKind::Volume => &VOLUME_NORMALIZER,
        RecordKind::Incident => &INCIDENT_NORMALIZER,
    }
}

pub fn normalize(raw: Table, kind: RecordKind) -> Result<Table, NormalizeError> {
    normalizer_for(kind).normalize(raw)
}

/// Filename-based classification policy. Plain functions and closures
/// `Fn(&str) -> Option<RecordKind>` are classifiers too.
pub trait FileClassifier: Send + Sync {
    fn classify(&self, file_name: &str) -> Option<RecordKind>;
}

impl<F> FileClassifier for F
where
    F: Fn(&str) -> Option<RecordKind> + Send + Sync,
{
    fn classify(&self, file_name: &str) -> Option<RecordKind> {
        self(file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub kind: RecordKind,
    pub contains_any: Vec<String>,
}

/// Case-sensitive keyword classifier. Rules are tried in order; the first
/// rule with a keyword contained in the file name wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordClassifier {
    #[serde(default = "default_extension")]
    pub extension: String,
    pub rules: Vec<ClassifierRule>,
}

fn default_extension() -> String {
    "csv".to_string()
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            extension: default_extension(),
            rules: vec![
                ClassifierRule {
                    kind: RecordKind::Incident,
                    contains_any: vec!["Incidents".to_string()],
                },
                ClassifierRule {
                    kind: RecordKind::Volume,
                    contains_any: vec!["Flow".to_string(), "Volume".to_string()],
                },
            ],
        }
    }
}

impl KeywordClassifier {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing classifier rules")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

impl FileClassifier for KeywordClassifier {
    fn classify(&self, file_name: &str) -> Option<RecordKind> {
        let suffix = format!(".{}", self.extension.trim_start_matches('.'));
        if !file_name.ends_with(&suffix) {
            return None;
        }
        self.rules
            .iter()
            .find(|rule| rule.contains_any.iter().any(|k| file_name.contains(k.as_str())))
            .map(|rule| rule.kind)
    }
}

/// One unified table per record kind.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedTables {
    pub volume: Table,
    pub incident: Table,
}

impl Default for UnifiedTables {
    fn default() -> Self {
        let empty = |kind: RecordKind| {
            Table::new(kind.canonical_columns().iter().map(|c| c.to_string()).collect())
        };
        Self {
            volume: empty(RecordKind::Volume),
            incident: empty(RecordKind::Incident),
        }
    }
}

impl UnifiedTables {
    pub fn get(&self, kind: RecordKind) -> &Table {
        match kind {
            RecordKind::Volume => &self.volume,
            RecordKind::Incident => &self.incident,
        }
    }

    fn get_mut(&mut self, kind: RecordKind) -> &mut Table {
        match kind {
            RecordKind::Volume => &mut self.volume,
            RecordKind::Incident => &mut self.incident,
        }
    }

    /// Incident-only view, for callers that persist volumes separately.
    pub fn into_incident(self) -> Table {
        self.incident
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStat {
    pub file_name: String,
    pub kind: RecordKind,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOutcome {
    pub tables: UnifiedTables,
    pub sources: Vec<SourceStat>,
    pub skipped: Vec<String>,
}

pub struct BatchIngestor {
    classifier: Box<dyn FileClassifier>,
}

impl Default for BatchIngestor {
    fn default() -> Self {
        Self::new(Box::new(KeywordClassifier::default()))
    }
}

impl BatchIngestor {
    pub fn new(classifier: Box<dyn FileClassifier>) -> Self {
        Self { classifier }
    }

    pub fn classify(&self, file_name: &str) -> Option<RecordKind> {
        self.classifier.classify(file_name)
    }

    /// Reads and normalizes a single record source.
    pub fn ingest_file(&self, path: impl AsRef<Path>, kind: RecordKind) -> Result<Table> {
        let path = path.as_ref();
        info!(path = %path.display(), %kind, "importing record source");
        let raw = read_record_source(path)?;
        normalize(raw, kind).with_context(|| format!("normalizing {} as {kind}", path.display()))
    }

    /// Ingests every classifiable file in `dir`, in file-name order.
    /// Unclassified entries are skipped, never an error.
    pub fn ingest_dir(&self, dir: impl AsRef<Path>) -> Result<IngestOutcome> {
        let dir = dir.as_ref();
        let mut entries: Vec<(String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry.with_context(|| format!("reading an entry of {}", dir.display()))?;
            let path = entry.path();
            // metadata follows symlinks; dangling links are not files
            if !fs::metadata(&path).is_ok_and(|meta| meta.is_file()) {
                continue;
            }
            entries.push((entry.file_name().to_string_lossy().to_string(), path));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut outcome = IngestOutcome::default();
        for (file_name, path) in entries {
            let Some(kind) = self.classify(&file_name) else {
                debug!(file_name = %file_name, "skipping unclassified file");
                outcome.skipped.push(file_name);
                continue;
            };
            let table = self.ingest_file(&path, kind)?;
            outcome.sources.push(SourceStat {
                file_name,
                kind,
                rows: table.len(),
            });
            outcome.tables.get_mut(kind).append(table);
        }

        info!(
            sources = outcome.sources.len(),
            skipped = outcome.skipped.len(),
            volume_rows = outcome.tables.volume.len(),
            incident_rows = outcome.tables.incident.len(),
            "batch ingested"
        );
        Ok(outcome)
    }
}
