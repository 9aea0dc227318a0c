#![forbid(unsafe_code)]

//! Operation descriptors accepted by the plan builder.
//!
//! The descriptor is the language-neutral input handed over by the schema
//! layer. Everything here is shape only: the builder owns validation, so most
//! scalar fields are kept loose (`String`, raw JSON) and checked there with
//! field-accurate error messages.

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

use crate::qir::errors::{QirError, Result};

/// Table selection descriptor.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectDescriptor {
    /// Base table name.
    pub table: String,
    /// Alias for the base table.
    pub alias: String,
    /// Projected columns; `["*"]` selects every catalog column.
    pub columns: Vec<String>,
    /// Comparison filters, ANDed together.
    pub filters: Vec<FilterSpec>,
    /// Optional filter DSL tree, ANDed with `filters`.
    #[serde(rename = "where")]
    pub where_clause: Option<JsonValue>,
    /// Explicit joins.
    pub joins: Vec<JoinSpec>,
    /// Correlated child collections aggregated to JSON arrays.
    pub lists: Vec<ListSpec>,
    /// Correlated child row counts.
    pub counts: Vec<CountSpec>,
    /// Requested ordering.
    pub order_by: Vec<OrderSpec>,
    /// Positive integer row limit.
    pub limit: Option<JsonValue>,
    /// Non-negative integer row offset.
    pub offset: Option<JsonValue>,
    /// `DISTINCT ON` columns.
    pub distinct_on: Vec<String>,
}

impl SelectDescriptor {
    /// Creates a descriptor for `table AS alias`.
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
            ..Self::default()
        }
    }

    /// Deserializes a descriptor from JSON.
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        Self::deserialize(value).map_err(|err| QirError::validation("descriptor", err.to_string()))
    }
}

/// Single `column op operand` filter.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterSpec {
    /// Column path, `column` or `alias.column`.
    pub column: String,
    /// Operator spelling (`eq`, `ilike`, `in`, ...).
    pub op: String,
    /// Parameter operand.
    pub param: Option<ParamSpec>,
    /// Literal operand; `Some(Null)` when the field was present as `null`.
    #[serde(deserialize_with = "present")]
    pub value: Option<JsonValue>,
}

/// Parameter declaration inside a filter.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub ty: Option<String>,
    /// Runtime-supplied marker.
    pub special: Option<String>,
}

impl ParamSpec {
    /// Creates a typed parameter declaration.
    pub fn typed(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty.into()),
            special: None,
        }
    }
}

/// Join against a table or an uncorrelated nested selection.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JoinSpec {
    /// Joined table.
    pub table: Option<String>,
    /// Nested selection joined as a subquery.
    pub select: Option<Box<SelectDescriptor>>,
    /// Alias for the joined relation.
    pub alias: String,
    /// `inner` (default) or `left`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Equality conditions; required.
    pub on: Option<OneOrMany<ColumnPair>>,
}

/// `left = right` join condition with qualified column references.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnPair {
    /// Left reference, `alias.column`.
    pub left: String,
    /// Right reference, `alias.column`.
    pub right: String,
}

/// Parent/child column correlation.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchPair {
    /// Column on the parent side.
    pub local: String,
    /// Column on the child side.
    pub foreign: String,
}

/// Child collection aggregated into a JSON array column.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ListSpec {
    /// Output column name.
    pub name: String,
    /// Child table.
    pub table: String,
    /// Child alias.
    pub alias: String,
    /// Child columns placed in each JSON object.
    pub columns: Vec<String>,
    /// Correlation pairs.
    #[serde(rename = "match")]
    pub on_match: Option<OneOrMany<MatchPair>>,
    /// Additional child filters.
    pub filters: Vec<FilterSpec>,
    /// Child filter DSL.
    #[serde(rename = "where")]
    pub where_clause: Option<JsonValue>,
    /// Aggregation order.
    pub order_by: Vec<OrderSpec>,
    /// Nested child collections.
    pub lists: Vec<ListSpec>,
    /// Drop parents that have no matching children.
    pub required: bool,
}

/// Child row count projected as a scalar subquery.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CountSpec {
    /// Output column name.
    pub name: String,
    /// Child table.
    pub table: String,
    /// Child alias.
    pub alias: String,
    /// Correlation pairs.
    #[serde(rename = "match")]
    pub on_match: Option<OneOrMany<MatchPair>>,
    /// Additional child filters.
    pub filters: Vec<FilterSpec>,
    /// Child filter DSL.
    #[serde(rename = "where")]
    pub where_clause: Option<JsonValue>,
}

/// ORDER BY entry.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrderSpec {
    /// Column path.
    pub column: String,
    /// `asc` (default) or `desc`.
    pub dir: Option<String>,
    /// `first` or `last`.
    pub nulls: Option<String>,
}

impl OrderSpec {
    /// Ascending order on `column`.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ..Self::default()
        }
    }
}

/// Accepts either a single object or an array of them.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// Single entry.
    One(T),
    /// Several entries.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Borrows the entries as a slice.
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}
