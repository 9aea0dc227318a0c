#![forbid(unsafe_code)]

//! Scalar type names accepted for parameter casts and catalog columns.

/// Canonical scalar types a parameter may be cast to.
static CANONICAL_TYPES: &[&str] = &[
    "bigint",
    "boolean",
    "bytea",
    "date",
    "double precision",
    "integer",
    "json",
    "jsonb",
    "numeric",
    "real",
    "smallint",
    "text",
    "time",
    "timestamp",
    "timestamptz",
    "uuid",
];

/// Alias spellings and the canonical name they map to.
static TYPE_ALIASES: &[(&str, &str)] = &[
    ("bool", "boolean"),
    ("char", "text"),
    ("character varying", "text"),
    ("decimal", "numeric"),
    ("double", "double precision"),
    ("float", "double precision"),
    ("float4", "real"),
    ("float8", "double precision"),
    ("int", "integer"),
    ("int2", "smallint"),
    ("int4", "integer"),
    ("int8", "bigint"),
    ("string", "text"),
    ("timestamp with time zone", "timestamptz"),
    ("timestamp without time zone", "timestamp"),
    ("varchar", "text"),
];

/// Normalizes a type name to its canonical spelling.
///
/// Accepts aliases (`varchar`, `int`, `float8`, ...) and one level of array
/// suffix (`int[]` becomes `integer[]`). Returns `None` for anything outside
/// the allowed set.
pub fn normalize_type(raw: &str) -> Option<String> {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    let (base, array) = match collapsed.strip_suffix("[]") {
        Some(base) => (base.trim_end(), true),
        None => (collapsed.as_str(), false),
    };
    let canonical = canonical_scalar(base)?;
    Some(if array {
        format!("{canonical}[]")
    } else {
        canonical.to_owned()
    })
}

fn canonical_scalar(base: &str) -> Option<&'static str> {
    if let Some(found) = CANONICAL_TYPES.iter().find(|t| **t == base) {
        return Some(found);
    }
    TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == base)
        .map(|(_, canonical)| *canonical)
}

/// Returns true for a canonical array type (`text[]`).
pub fn is_array(ty: &str) -> bool {
    ty.ends_with("[]")
}

/// Returns true for `json`/`jsonb`.
pub fn is_json(ty: &str) -> bool {
    ty == "jsonb" || ty == "json"
}
