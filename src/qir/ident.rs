#![forbid(unsafe_code)]

//! SQL identifier validation and quoting.
//!
//! Two policies are supported. `minimal` quotes only when an identifier would
//! not survive as a bare PostgreSQL identifier; `strict` refuses anything that
//! is not already safe and quotes everything it accepts. Both enforce the
//! 63-byte `NAMEDATALEN` limit: identifiers are never truncated.

use serde::{Deserialize, Serialize};

use crate::qir::errors::{IdentifierViolation, QirError, Result};

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Reserved keywords that cannot appear as bare identifiers. Sorted.
static RESERVED_KEYWORDS: &[&str] = &[
    "all",
    "analyse",
    "analyze",
    "and",
    "any",
    "array",
    "as",
    "asc",
    "asymmetric",
    "authorization",
    "binary",
    "both",
    "case",
    "cast",
    "check",
    "collate",
    "collation",
    "column",
    "concurrently",
    "constraint",
    "create",
    "cross",
    "current_catalog",
    "current_date",
    "current_role",
    "current_schema",
    "current_time",
    "current_timestamp",
    "current_user",
    "default",
    "deferrable",
    "desc",
    "distinct",
    "do",
    "else",
    "end",
    "except",
    "false",
    "fetch",
    "for",
    "foreign",
    "freeze",
    "from",
    "full",
    "grant",
    "group",
    "having",
    "ilike",
    "in",
    "initially",
    "inner",
    "intersect",
    "into",
    "is",
    "isnull",
    "join",
    "lateral",
    "leading",
    "left",
    "like",
    "limit",
    "localtime",
    "localtimestamp",
    "natural",
    "not",
    "notnull",
    "null",
    "offset",
    "on",
    "only",
    "or",
    "order",
    "outer",
    "overlaps",
    "placing",
    "primary",
    "references",
    "returning",
    "right",
    "select",
    "session_user",
    "similar",
    "some",
    "symmetric",
    "system_user",
    "table",
    "tablesample",
    "then",
    "to",
    "trailing",
    "true",
    "union",
    "unique",
    "user",
    "using",
    "variadic",
    "verbose",
    "when",
    "where",
    "window",
    "with",
];

/// Quoting policy applied to every identifier the compiler renders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierPolicy {
    /// Quote only identifiers that are unsafe bare or reserved.
    #[default]
    Minimal,
    /// Require safe identifiers and quote unconditionally.
    Strict,
}

/// Returns true when `ident` matches `[a-z_][a-z0-9_]*`.
pub fn is_safe_bare(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Returns true when `ident` is a reserved keyword (case-insensitive).
pub fn is_reserved(ident: &str) -> bool {
    let lowered = ident.to_ascii_lowercase();
    RESERVED_KEYWORDS.binary_search(&lowered.as_str()).is_ok()
}

/// Fails when `ident` exceeds [`MAX_IDENTIFIER_LEN`] bytes.
pub fn check_length(ident: &str) -> Result<()> {
    if ident.len() > MAX_IDENTIFIER_LEN {
        return Err(QirError::identifier(
            ident,
            IdentifierViolation::TooLong { len: ident.len() },
        ));
    }
    Ok(())
}

/// Renders a single identifier under `policy`.
pub fn render(ident: &str, policy: IdentifierPolicy) -> Result<String> {
    if ident.is_empty() {
        return Err(QirError::identifier(ident, IdentifierViolation::Empty));
    }
    check_length(ident)?;
    match policy {
        IdentifierPolicy::Minimal => {
            if is_safe_bare(ident) && !is_reserved(ident) {
                Ok(ident.to_owned())
            } else {
                Ok(quote(ident))
            }
        }
        IdentifierPolicy::Strict => {
            if !is_safe_bare(ident) {
                return Err(QirError::identifier(ident, IdentifierViolation::Pattern));
            }
            if is_reserved(ident) {
                return Err(QirError::identifier(ident, IdentifierViolation::Reserved));
            }
            Ok(quote(ident))
        }
    }
}

/// Renders a possibly schema-qualified name (`schema.table`) part by part.
pub fn render_qualified(name: &str, policy: IdentifierPolicy) -> Result<String> {
    let parts = name
        .split('.')
        .map(|part| render(part, policy))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("."))
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Derives a safe base name for generated identifiers.
///
/// Lowercases, collapses runs of non-alphanumerics into a single underscore,
/// and trims underscores at both ends. An empty result yields `fallback`; a
/// result starting with a digit is prefixed with `fallback_`.
pub fn sanitize_base(raw: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        return fallback.to_owned();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("{fallback}_{out}");
    }
    out
}
