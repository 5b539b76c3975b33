//! Catalog index: the known (database, schema, table, column) facts.
//!
//! Every field is trimmed and lower-cased once, when the index is built.
//! Lookups take already-normalized keys; callers normalize identifiers with
//! [`normalize_name`] before asking.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LineageError, Result};

/// Canonical form of an identifier or catalog field.
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// One normalized catalog fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CatalogEntry {
    pub database: String,
    pub schema: String,
    pub table: String,
    pub column: String,
}

/// A catalog row as supplied by the caller, before normalization.
///
/// The spreadsheet-style headers (`Database Name`, ...) are accepted so
/// exported metadata sheets load without renaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CatalogRow {
    #[serde(default, alias = "Database Name")]
    pub database: String,
    #[serde(default, alias = "Schema Name")]
    pub schema: String,
    #[serde(alias = "Table Name")]
    pub table: String,
    #[serde(alias = "Column Name")]
    pub column: String,
}

impl CatalogRow {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    columns: Vec<CatalogRow>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonCatalog {
    Rows(Vec<CatalogRow>),
    File(CatalogFile),
}

/// Read-only lookup over catalog entries, indexed by table and by column.
#[derive(Debug, Default, Clone)]
pub struct CatalogIndex {
    // load order, duplicates collapsed
    entries: Vec<CatalogEntry>,
    by_table: HashMap<String, Vec<usize>>,
    by_column: HashMap<String, Vec<usize>>,
}

impl CatalogIndex {
    /// Normalize and index raw rows. Rows without a table or column name are
    /// skipped; repeated rows are collapsed to their first occurrence.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = CatalogRow>,
    {
        let mut index = Self::default();
        let mut seen: HashSet<CatalogEntry> = HashSet::new();
        for row in rows {
            let entry = CatalogEntry {
                database: normalize_name(&row.database),
                schema: normalize_name(&row.schema),
                table: normalize_name(&row.table),
                column: normalize_name(&row.column),
            };
            if entry.table.is_empty() || entry.column.is_empty() {
                tracing::debug!(?row, "skipping catalog row without table or column");
                continue;
            }
            if !seen.insert(entry.clone()) {
                continue;
            }
            let pos = index.entries.len();
            index
                .by_table
                .entry(entry.table.clone())
                .or_default()
                .push(pos);
            index
                .by_column
                .entry(entry.column.clone())
                .or_default()
                .push(pos);
            index.entries.push(entry);
        }
        index
    }

    /// Load a catalog file. `.toml` files hold `[[columns]]` tables; anything
    /// else is read as JSON (an array of rows or `{"columns": [...]}`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| LineageError::CatalogIo {
            path: path.to_path_buf(),
            source,
        })?;
        let index = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&text)?,
            _ => Self::from_json_str(&text)?,
        };
        tracing::info!(
            "Loaded {} catalog entries from {}",
            index.len(),
            path.display()
        );
        Ok(index)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let rows = match serde_json::from_str::<JsonCatalog>(text)
            .map_err(|e| LineageError::CatalogFormat(e.to_string()))?
        {
            JsonCatalog::Rows(rows) => rows,
            JsonCatalog::File(file) => file.columns,
        };
        Ok(Self::from_rows(rows))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(text).map_err(|e| LineageError::CatalogFormat(e.to_string()))?;
        Ok(Self::from_rows(file.columns))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Every entry for `table`, across all databases and schemas.
    pub fn columns_of(&self, table: &str) -> Vec<&CatalogEntry> {
        self.lookup(&self.by_table, table)
    }

    /// Every entry that has a column named `column`.
    pub fn tables_of(&self, column: &str) -> Vec<&CatalogEntry> {
        self.lookup(&self.by_column, column)
    }

    pub fn knows_table(&self, table: &str) -> bool {
        self.by_table.contains_key(table)
    }

    /// Database and schema of `table`, each present only when every catalog
    /// row for the table agrees on it.
    pub fn unique_db_schema(&self, table: &str) -> (Option<&str>, Option<&str>) {
        self.qualify(table, None, None)
    }

    /// Like [`Self::unique_db_schema`], but only rows agreeing with the
    /// qualifiers already written in the query are considered, and written
    /// qualifiers are returned unchanged.
    pub fn qualify<'a>(
        &'a self,
        table: &str,
        database: Option<&'a str>,
        schema: Option<&'a str>,
    ) -> (Option<&'a str>, Option<&'a str>) {
        let rows: Vec<&CatalogEntry> = self.columns_in(table, database, schema).collect();
        let database =
            database.or_else(|| unique_value(rows.iter().copied().map(|e| e.database.as_str())));
        let schema =
            schema.or_else(|| unique_value(rows.iter().copied().map(|e| e.schema.as_str())));
        (database, schema)
    }

    /// Entries for `table` compatible with the given (optional) qualifiers.
    pub fn columns_in<'a>(
        &'a self,
        table: &str,
        database: Option<&'a str>,
        schema: Option<&'a str>,
    ) -> impl Iterator<Item = &'a CatalogEntry> + 'a {
        self.columns_of(table).into_iter().filter(move |entry| {
            database.map_or(true, |db| entry.database == db)
                && schema.map_or(true, |s| entry.schema == s)
        })
    }

    pub fn has_column(
        &self,
        table: &str,
        database: Option<&str>,
        schema: Option<&str>,
        column: &str,
    ) -> bool {
        self.columns_in(table, database, schema)
            .any(|entry| entry.column == column)
    }

    fn lookup(&self, map: &HashMap<String, Vec<usize>>, key: &str) -> Vec<&CatalogEntry> {
        map.get(key)
            .map(|positions| positions.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }
}

fn unique_value<'a>(values: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let distinct: HashSet<&str> = values.collect();
    match distinct.into_iter().collect::<Vec<_>>().as_slice() {
        [only] if !only.is_empty() => Some(*only),
        _ => None,
    }
}
