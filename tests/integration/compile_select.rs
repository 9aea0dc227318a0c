use std::sync::Arc;

use qir::qir::ir::Param;
use qir::{Compiler, CompilerConfig, InMemoryCatalog, QirError};
use serde_json::json;

fn compiler() -> Compiler {
    let catalog = InMemoryCatalog::new()
        .with_table(
            "product",
            [
                ("id", "integer"),
                ("name", "varchar"),
                ("price", "numeric"),
                ("tags", "text[]"),
                ("attrs", "jsonb"),
                ("created_at", "timestamptz"),
                ("deleted_at", "timestamptz"),
            ],
        )
        .with_table("event", [("id", "integer"), ("meta", "json")]);
    Compiler::new(CompilerConfig::default(), Arc::new(catalog))
}

fn sql_for_where(filter: serde_json::Value) -> Result<String, QirError> {
    compiler()
        .compile_json(&json!({"table": "product", "alias": "t0", "where": filter}))
        .map(|out| out.sql)
}

#[test]
fn end_to_end_selection() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id", "name"],
            "filters": [{"column": "name", "op": "ilike", "param": {"name": "q", "type": "text"}}],
            "orderBy": [{"column": "name"}],
            "limit": 50
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT t0.id, t0.name FROM product t0 WHERE t0.name ILIKE $1::text \
         ORDER BY t0.name ASC, t0.id ASC LIMIT 50"
    );
    assert_eq!(out.params, vec![Param::new("q").typed("text")]);
}

#[test]
fn compiling_twice_is_byte_identical() {
    let desc = json!({
        "table": "product",
        "alias": "t0",
        "columns": ["*"],
        "where": {"OR": [
            {"price": {"gte": {"param": {"name": "min"}}}},
            {"tags": {"contains": {"param": {"name": "tags", "type": "text[]"}}}}
        ]},
        "orderBy": [{"column": "created_at", "dir": "desc", "nulls": "last"}],
        "offset": 20
    });
    let c = compiler();
    let first = c.compile_json(&desc).expect("first");
    let second = c.compile_json(&desc).expect("second");
    assert_eq!(first, second);
    assert_eq!(
        first.sql,
        "SELECT t0.id, t0.name, t0.price, t0.tags, t0.attrs, t0.created_at, t0.deleted_at \
         FROM product t0 WHERE (t0.price >= $1::numeric OR t0.tags @> $2::text[]) \
         ORDER BY t0.created_at DESC NULLS LAST, t0.id ASC OFFSET 20"
    );
}

#[test]
fn null_comparisons_become_null_checks() {
    assert_eq!(
        sql_for_where(json!({"deleted_at": {"eq": null}})).unwrap(),
        "SELECT * FROM product t0 WHERE t0.deleted_at IS NULL ORDER BY t0.id ASC"
    );
    assert_eq!(
        sql_for_where(json!({"deleted_at": {"ne": null}})).unwrap(),
        "SELECT * FROM product t0 WHERE NOT (t0.deleted_at IS NULL) ORDER BY t0.id ASC"
    );
    assert_eq!(
        sql_for_where(json!({"deleted_at": {"isNull": false}})).unwrap(),
        "SELECT * FROM product t0 WHERE t0.deleted_at IS NOT NULL ORDER BY t0.id ASC"
    );
    let err = sql_for_where(json!({"price": {"gt": null}})).unwrap_err();
    assert_eq!(err.code(), "ValidationError");
}

#[test]
fn in_requires_an_array_typed_parameter() {
    let err = sql_for_where(json!({"name": {"in": {"param": {"name": "names"}}}})).unwrap_err();
    assert_eq!(err.code(), "ParameterTypeError");
    let err =
        sql_for_where(json!({"name": {"in": {"param": {"name": "names", "type": "text"}}}}))
            .unwrap_err();
    assert_eq!(err.code(), "ParameterTypeError");
    assert_eq!(
        sql_for_where(json!({"name": {"in": {"param": {"name": "names", "type": "text[]"}}}}))
            .unwrap(),
        "SELECT * FROM product t0 WHERE t0.name = ANY($1::text[]) ORDER BY t0.id ASC"
    );
    assert_eq!(
        sql_for_where(json!({"name": {"in": []}})).unwrap(),
        "SELECT * FROM product t0 WHERE FALSE ORDER BY t0.id ASC"
    );
}

#[test]
fn contains_falls_back_to_ilike_on_text() {
    assert_eq!(
        sql_for_where(json!({"name": {"contains": "50%"}})).unwrap(),
        "SELECT * FROM product t0 WHERE t0.name ILIKE '%50\\%%' ORDER BY t0.id ASC"
    );
    assert_eq!(
        sql_for_where(json!({"attrs": {"contains": {"color": "red"}}})).unwrap(),
        "SELECT * FROM product t0 WHERE t0.attrs @> '{\"color\":\"red\"}'::jsonb ORDER BY t0.id ASC"
    );
    let err = sql_for_where(json!({"name": {"ilike": {"param": {"name": "q"}}}})).unwrap_err();
    assert_eq!(err.code(), "ParameterTypeError");
}

#[test]
fn contains_param_on_text_escapes_like_metacharacters() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id"],
            "where": {"name": {"contains": {"param": {"name": "q", "type": "text"}}}}
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT t0.id FROM product t0 WHERE t0.name ILIKE concat('%', \
         replace(replace(replace($1::text, '\\', '\\\\'), '%', '\\%'), '_', '\\_'), '%') \
         ORDER BY t0.id ASC"
    );
}

#[test]
fn contains_only_applies_where_postgres_defines_it() {
    let err = sql_for_where(json!({"price": {"contains": "5"}})).unwrap_err();
    assert_eq!(err.code(), "ParameterTypeError");
    assert!(err.to_string().contains("numeric column 'price'"), "{err}");

    let out = compiler()
        .compile_json(&json!({
            "table": "event",
            "alias": "e",
            "where": {"meta": {"contains": {"k": 1}}}
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT * FROM event e WHERE to_jsonb(e.meta) @> '{\"k\":1}'::jsonb ORDER BY e.id ASC"
    );
}

#[test]
fn array_literals_render_as_array_constructors() {
    assert_eq!(
        sql_for_where(json!({"tags": {"eq": ["a", "b"]}})).unwrap(),
        "SELECT * FROM product t0 WHERE t0.tags = ARRAY['a', 'b']::text[] ORDER BY t0.id ASC"
    );
    assert_eq!(
        sql_for_where(json!({"tags": {"contains": ["sale"]}})).unwrap(),
        "SELECT * FROM product t0 WHERE t0.tags @> ARRAY['sale']::text[] ORDER BY t0.id ASC"
    );
    let err = sql_for_where(json!({"price": {"eq": [1, 2]}})).unwrap_err();
    assert_eq!(err.code(), "ParameterTypeError");
}

#[test]
fn filter_errors_name_the_path() {
    let err = sql_for_where(json!({"AND": [{"name": {"eq": "a"}}, {"nope": {"eq": 1}}]}))
        .unwrap_err();
    assert_eq!(
        err,
        QirError::validation("where.AND[1].nope.eq", "unknown column 't0.nope'")
    );
    let err = sql_for_where(json!({"name": {"eq": "a"}, "price": {"eq": 1}})).unwrap_err();
    assert_eq!(
        err,
        QirError::validation("where", "filter must contain exactly one key")
    );
}

#[test]
fn shared_parameter_gets_one_ordinal() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "filters": [
                {"column": "name", "op": "eq", "param": {"name": "term"}},
                {"column": "price", "op": "lt", "param": {"name": "cap"}}
            ],
            "where": {"name": {"ne": {"param": {"name": "term"}}}}
        }))
        .expect("compile");
    let names: Vec<&str> = out.params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["term", "cap"]);
    assert_eq!(
        out.sql,
        "SELECT * FROM product t0 WHERE t0.name = $1::text AND t0.price < $2::numeric \
         AND t0.name <> $1::text ORDER BY t0.id ASC"
    );
}

#[test]
fn distinct_on_leads_order_by() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["name", "price"],
            "distinctOn": ["name"],
            "orderBy": [{"column": "price", "dir": "desc"}]
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT DISTINCT ON (t0.name) t0.name, t0.price FROM product t0 \
         ORDER BY t0.name ASC, t0.price DESC, t0.id ASC"
    );
}
