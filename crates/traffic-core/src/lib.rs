//! Core data model for traffic ingestion: record kinds, tables, and UI selectors.

use std::cmp::Ordering;
use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub const CRATE_NAME: &str = "traffic-core";

pub const VOLUME_DATABASE: &str = "db_volume";
pub const INCIDENT_DATABASE: &str = "db_incident";

pub const YEAR_COLUMN: &str = "year";

pub const VOLUME_COLUMNS: [&str; 5] = ["segment_name", "year", "the_geom", "length_m", "volume"];

pub const INCIDENT_COLUMNS: [&str; 10] = [
    "incident_info",
    "description",
    "start_dt",
    "modified_dt",
    "year",
    "quadrant",
    "longitude",
    "latitude",
    "location",
    "count",
];

/// The two record families found in traffic exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Volume,
    Incident,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Volume, RecordKind::Incident];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Volume => "traffic_volume",
            RecordKind::Incident => "traffic_incident",
        }
    }

    /// Fixed output column order after normalization.
    pub fn canonical_columns(self) -> &'static [&'static str] {
        match self {
            RecordKind::Volume => &VOLUME_COLUMNS,
            RecordKind::Incident => &INCIDENT_COLUMNS,
        }
    }

    pub fn sort_key(self) -> &'static str {
        match self {
            RecordKind::Volume => "volume",
            RecordKind::Incident => "count",
        }
    }

    pub fn database(self) -> &'static str {
        match self {
            RecordKind::Volume => VOLUME_DATABASE,
            RecordKind::Incident => INCIDENT_DATABASE,
        }
    }

    pub fn unified_collection(self) -> &'static str {
        match self {
            RecordKind::Volume => "all_volumes",
            RecordKind::Incident => "all_incidents",
        }
    }

    fn year_collection_suffix(self) -> &'static str {
        match self {
            RecordKind::Volume => "_traffic_volume_flow",
            RecordKind::Incident => "_traffic_incidents",
        }
    }

    pub fn year_collection(self, year: i64) -> String {
        format!("{year}{}", self.year_collection_suffix())
    }

    /// Inverse of [`RecordKind::year_collection`]: the year a per-year
    /// collection name of this kind encodes.
    pub fn year_of_collection(self, name: &str) -> Option<i64> {
        let year = name
            .strip_suffix(self.year_collection_suffix())?
            .parse::<i64>()
            .ok()?;
        (self.year_collection(year) == name).then_some(year)
    }

    /// Maps a UI selector category (`volume`, `incidents`) onto a kind.
    pub fn from_selector_category(category: &str) -> Option<Self> {
        match category {
            "volume" => Some(RecordKind::Volume),
            "incidents" => Some(RecordKind::Incident),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Row = Vec<Value>;

/// Column-named, row-ordered table of JSON cells.
///
/// Row identity is positional: concatenating tables re-indexes rows
/// `0..len()` in the order they were appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a table, padding short rows with nulls and truncating long ones.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Value::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn column_values(&self, column: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    pub fn push_row(&mut self, mut row: Row) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn lowercase_columns(&mut self) {
        for column in &mut self.columns {
            *column = column.to_lowercase();
        }
    }

    /// Renames `from` to `to` if present. Returns whether a rename happened.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_index(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        true
    }

    /// Replaces (or appends) a column. `values` shorter than the table are
    /// null-padded.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        let idx = match self.column_index(name) {
            Some(idx) => idx,
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(Value::Null);
                }
                self.columns.len() - 1
            }
        };
        let mut values = values.into_iter();
        for row in &mut self.rows {
            row[idx] = values.next().unwrap_or(Value::Null);
        }
    }

    /// Reorders into exactly `columns`; missing columns become nulls and
    /// extra columns are dropped.
    pub fn project(&self, columns: &[&str]) -> Table {
        let indexes: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indexes
                    .iter()
                    .map(|idx| idx.map(|i| row[i].clone()).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Table {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    /// Appends `other` below `self`, unioning columns by name.
    pub fn append(&mut self, other: Table) {
        if self.columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return;
        }
        for column in &other.columns {
            if !self.has_column(column) {
                self.columns.push(column.clone());
                for row in &mut self.rows {
                    row.push(Value::Null);
                }
            }
        }
        let mapping: Vec<Option<usize>> = self
            .columns
            .iter()
            .map(|c| other.column_index(c))
            .collect();
        for mut row in other.rows {
            let aligned = mapping
                .iter()
                .map(|idx| match idx {
                    Some(i) => std::mem::take(&mut row[*i]),
                    None => Value::Null,
                })
                .collect();
            self.rows.push(aligned);
        }
    }

    /// One JSON object per row, fields in column order.
    pub fn to_documents(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Map<String, Value>>()
            })
            .collect()
    }

    /// Rebuilds a table from documents. Columns are the ordered union of
    /// document keys minus `strip`.
    pub fn from_documents<I>(documents: I, strip: &[&str]) -> Table
    where
        I: IntoIterator<Item = Map<String, Value>>,
    {
        let documents: Vec<Map<String, Value>> = documents.into_iter().collect();
        let mut columns: Vec<String> = Vec::new();
        for doc in &documents {
            for key in doc.keys() {
                if !strip.contains(&key.as_str()) && !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows = documents
            .into_iter()
            .map(|mut doc| {
                columns
                    .iter()
                    .map(|c| doc.remove(c).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Table { columns, rows }
    }

    /// Rows whose `year` equals `year`, in their original order.
    pub fn filter_by_year(&self, year: i64) -> Table {
        let Some(idx) = self.column_index(YEAR_COLUMN) else {
            return Table::new(self.columns.clone());
        };
        Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| cell_as_year(&row[idx]) == Some(year))
                .cloned()
                .collect(),
        }
    }

    /// Distinct integer years present, ascending.
    pub fn distinct_years(&self) -> Vec<i64> {
        let Some(values) = self.column_values(YEAR_COLUMN) else {
            return Vec::new();
        };
        let mut years: Vec<i64> = values.into_iter().filter_map(cell_as_year).collect();
        years.sort_unstable();
        years.dedup();
        years
    }

    /// Stable ascending sort on the kind's sort key.
    pub fn sort_by(&mut self, kind: RecordKind) {
        self.sort_by_column(kind.sort_key());
    }

    /// Stable ascending sort; a missing column leaves the order unchanged.
    pub fn sort_by_column(&mut self, column: &str) {
        if let Some(idx) = self.column_index(column) {
            self.rows.sort_by(|a, b| compare_cells(&a[idx], &b[idx]));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Integer,
    Float,
    Text,
}

fn column_type(cells: &[&str]) -> ColumnType {
    let present = || cells.iter().map(|c| c.trim()).filter(|c| !c.is_empty());
    if present().all(|c| c.parse::<i64>().is_ok()) {
        ColumnType::Integer
    } else if present().all(|c| c.parse::<f64>().is_ok_and(f64::is_finite)) {
        ColumnType::Float
    } else {
        ColumnType::Text
    }
}

/// Types one raw CSV column as a whole: integers if every non-empty cell
/// is an integer, floats if every one is a finite number, otherwise the
/// cells exactly as written. Empty cells are null in every column.
pub fn parse_column(cells: &[&str]) -> Vec<Value> {
    let ty = column_type(cells);
    cells
        .iter()
        .map(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Value::Null;
            }
            let typed = match ty {
                ColumnType::Integer => trimmed.parse::<i64>().ok().map(Value::from),
                ColumnType::Float => trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number),
                ColumnType::Text => None,
            };
            typed.unwrap_or_else(|| Value::String((*raw).to_string()))
        })
        .collect()
}

/// Integer view of a year cell. Whole floats count (`2017.0`), strings do not.
pub fn cell_as_year(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    if let Some(v) = n.as_i64() {
        return Some(v);
    }
    n.as_f64()
        .filter(|f| f.fract() == 0.0 && f.is_finite())
        .map(|f| f as i64)
}

fn cell_rank(value: &Value) -> u8 {
    match value {
        Value::Number(_) => 0,
        Value::Bool(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) | Value::Object(_) => 3,
        Value::Null => 4,
    }
}

/// Total order over cells: numbers, booleans, strings, composites, then nulls.
pub fn compare_cells(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => cell_rank(a).cmp(&cell_rank(b)),
    }
}

/// Database/collection pair addressed by a UI selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub database: String,
    pub collection: String,
}

/// Result of a selector lookup. `Unmapped` keys are known but have no
/// collection assigned yet; `Unknown` keys are not in the table at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorLookup {
    Mapped(CollectionRef),
    Unmapped,
    Unknown,
}

impl SelectorLookup {
    pub fn mapped(&self) -> Option<&CollectionRef> {
        match self {
            SelectorLookup::Mapped(r) => Some(r),
            _ => None,
        }
    }
}

pub const SELECTOR_CATEGORIES: [&str; 2] = ["volume", "incidents"];
pub const SELECTOR_YEARS: RangeInclusive<i32> = 2016..=2020;

const SELECTOR_ASSIGNMENTS: &[(&str, &str, &str)] =
    &[("volume/2017", VOLUME_DATABASE, "2017_traffic_volume_flow")];

/// Looks up a combined `category/year` key such as `volume/2017`.
pub fn lookup_selector_key(key: &str) -> SelectorLookup {
    if let Some((_, database, collection)) =
        SELECTOR_ASSIGNMENTS.iter().find(|(k, _, _)| *k == key)
    {
        return SelectorLookup::Mapped(CollectionRef {
            database: (*database).to_string(),
            collection: (*collection).to_string(),
        });
    }
    let known = key
        .split_once('/')
        .filter(|(category, _)| SELECTOR_CATEGORIES.contains(category))
        .and_then(|(_, raw)| raw.parse::<i32>().ok().filter(|year| year.to_string() == raw))
        .is_some_and(|year| SELECTOR_YEARS.contains(&year));
    if known {
        SelectorLookup::Unmapped
    } else {
        SelectorLookup::Unknown
    }
}

pub fn lookup_selector(category: &str, year: i32) -> SelectorLookup {
    lookup_selector_key(&format!("{category}/{year}"))
}
