#![forbid(unsafe_code)]

//! Column/type catalog consumed by the plan builder and the primary-key hook
//! consumed by the lowering engine.
//!
//! The schema layer that owns table metadata lives outside this crate; these
//! traits are the seam it plugs into.

use std::collections::HashMap;

use crate::qir::types::normalize_type;

/// Resolves the column used as the ORDER BY tie-breaker for a table.
pub trait PrimaryKeyResolver {
    /// Returns the primary-key column of `table`, or `None` when the table
    /// has no usable key.
    fn primary_key(&self, table: &str) -> Option<String>;
}

/// Provides table → column → scalar type lookups.
pub trait Catalog: PrimaryKeyResolver + Send + Sync {
    /// Whether `table` is known.
    fn has_table(&self, table: &str) -> bool;
    /// Declared type of `table.column` as stored in the catalog.
    fn column_type(&self, table: &str, column: &str) -> Option<String>;
    /// All columns of `table` in declaration order.
    fn columns(&self, table: &str) -> Vec<String>;
}

#[derive(Clone, Debug, Default)]
struct TableEntry {
    columns: Vec<(String, String)>,
    primary_key: Option<String>,
}

/// Simple in-memory catalog used for tests or embedding.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    tables: HashMap<String, TableEntry>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table with `(column, type)` pairs.
    pub fn with_table<I, C, T>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = (C, T)>,
        C: Into<String>,
        T: Into<String>,
    {
        let columns: Vec<(String, String)> = columns
            .into_iter()
            .map(|(c, t)| (c.into(), t.into()))
            .collect();
        self.tables.insert(
            name.into(),
            TableEntry {
                columns,
                primary_key: None,
            },
        );
        self
    }

    /// Declares the primary key of a registered table.
    pub fn with_primary_key(mut self, table: &str, column: impl Into<String>) -> Self {
        if let Some(entry) = self.tables.get_mut(table) {
            entry.primary_key = Some(column.into());
        }
        self
    }
}

impl PrimaryKeyResolver for InMemoryCatalog {
    fn primary_key(&self, table: &str) -> Option<String> {
        self.tables.get(table)?.primary_key.clone()
    }
}

impl Catalog for InMemoryCatalog {
    fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    fn column_type(&self, table: &str, column: &str) -> Option<String> {
        self.tables
            .get(table)?
            .columns
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, t)| t.clone())
    }

    fn columns(&self, table: &str) -> Vec<String> {
        self.tables
            .get(table)
            .map(|entry| entry.columns.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }
}

/// Tie-breaker resolver that assumes every table has the same key column.
#[derive(Clone, Debug)]
pub struct HeuristicPrimaryKey(pub String);

impl Default for HeuristicPrimaryKey {
    fn default() -> Self {
        Self("id".to_owned())
    }
}

impl PrimaryKeyResolver for HeuristicPrimaryKey {
    fn primary_key(&self, _table: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Returns the canonical type of a catalog column, falling back to the raw
/// declaration when it is outside the parameter type set.
pub fn canonical_column_type(catalog: &dyn Catalog, table: &str, column: &str) -> Option<String> {
    let raw = catalog.column_type(table, column)?;
    Some(normalize_type(&raw).unwrap_or(raw))
}
