use std::sync::Arc;

use qir::{Compiler, CompilerConfig, InMemoryCatalog, QirError, SelectDescriptor};
use serde_json::json;

fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_table(
            "product",
            [("id", "integer"), ("name", "text"), ("brand_id", "integer")],
        )
        .with_table("brand", [("id", "integer"), ("name", "text")])
        .with_table("order-items", [("id", "integer"), ("qty", "integer")])
}

fn compiler(config: CompilerConfig) -> Compiler {
    Compiler::new(config, Arc::new(catalog()))
}

fn search() -> SelectDescriptor {
    SelectDescriptor::from_json(&json!({
        "table": "product",
        "alias": "t0",
        "columns": ["id", "name"],
        "filters": [{"column": "name", "op": "ilike", "param": {"name": "q", "type": "text"}}],
        "orderBy": [{"column": "name"}],
        "limit": 50
    }))
    .expect("descriptor")
}

#[test]
fn function_name_is_sanitized_and_prefixed() {
    let ddl = compiler(CompilerConfig::default())
        .emit_function("My Op!", &search())
        .expect("emit");
    assert_eq!(
        ddl,
        "CREATE OR REPLACE FUNCTION public.op_my_op(q text) RETURNS SETOF jsonb LANGUAGE sql \
         STABLE AS $$ SELECT to_jsonb(q.*) FROM (SELECT t0.id, t0.name FROM product t0 \
         WHERE t0.name ILIKE $1::text ORDER BY t0.name ASC, t0.id ASC LIMIT 50) q $$;"
    );
}

#[test]
fn oversized_parameter_identifier_is_rejected() {
    let long = "p".repeat(64);
    let desc = SelectDescriptor::from_json(&json!({
        "table": "product",
        "alias": "t0",
        "filters": [{"column": "name", "op": "eq", "param": {"name": long}}]
    }))
    .expect("descriptor");
    let err = compiler(CompilerConfig::default())
        .emit_function("search", &desc)
        .unwrap_err();
    assert_eq!(err.code(), "IdentifierError");
    assert!(err.to_string().contains("exceeds 63 bytes (got 64)"));
}

#[test]
fn views_are_schema_qualified_and_parameter_free() {
    let c = compiler(CompilerConfig::default().with_schema("api"));
    let desc = SelectDescriptor::from_json(&json!({
        "table": "product", "alias": "t0", "columns": ["id"]
    }))
    .expect("descriptor");
    assert_eq!(
        c.emit_view("all products", &desc).expect("view"),
        "CREATE OR REPLACE VIEW api.op_all_products AS SELECT t0.id FROM product t0 ORDER BY t0.id ASC;"
    );
    let err = c.emit_view("search", &search()).unwrap_err();
    assert_eq!(err.code(), "ValidationError");
}

#[test]
fn identifier_policy_governs_table_names() {
    let desc = SelectDescriptor::new("order-items", "o");
    let minimal = compiler(CompilerConfig::default())
        .compile(&desc)
        .expect("minimal");
    assert_eq!(minimal.sql, "SELECT * FROM \"order-items\" o ORDER BY o.id ASC");

    let err = compiler(CompilerConfig::strict()).compile(&desc).unwrap_err();
    assert_eq!(err.code(), "IdentifierError");
    assert_eq!(
        err.to_string(),
        "identifier 'order-items' must match [a-z_][a-z0-9_]*"
    );

    let strict = compiler(CompilerConfig::strict())
        .compile(&SelectDescriptor::new("product", "t0"))
        .expect("strict");
    assert_eq!(
        strict.sql,
        "SELECT * FROM \"product\" \"t0\" ORDER BY \"t0\".\"id\" ASC"
    );
}

#[test]
fn joined_operations_must_name_their_columns() {
    let c = compiler(CompilerConfig::default());
    let joined = json!({
        "table": "product",
        "alias": "t0",
        "joins": [{"table": "brand", "alias": "b", "on": {"left": "t0.brand_id", "right": "b.id"}}]
    });
    let desc = SelectDescriptor::from_json(&joined).expect("descriptor");
    let err = c.emit_view("v", &desc).unwrap_err();
    assert_eq!(
        err,
        QirError::validation(
            "columns",
            "an operation over joined relations must list its columns"
        )
    );
    assert!(c.emit_function("f", &desc).is_err());

    let mut named = joined;
    named["columns"] = json!(["id", "b.name"]);
    let desc = SelectDescriptor::from_json(&named).expect("descriptor");
    assert_eq!(
        c.emit_view("v", &desc).expect("view"),
        "CREATE OR REPLACE VIEW public.op_v AS SELECT t0.id, b.name FROM product t0 \
         INNER JOIN brand b ON t0.brand_id = b.id ORDER BY t0.id ASC;"
    );
}
